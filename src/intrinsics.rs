/// Built-in host callables.
///
/// The standard library proper lives outside the VM; what the engine ships
/// is the host-callable surface programs reach through `Import` and the
/// bare-then-suffix lookup rule. Names are registered in their
/// type-qualified form (`Math.Sqrt`), so `Call "Sqrt"` resolves through the
/// suffix scan and `Call "Math.Sqrt"` exactly.
use std::sync::Arc;

use crate::core::value::Value;
use crate::env::{HostFn, ReturnKind, RuntimeEnv};

pub const BUILTIN_MODULES: &[&str] = &["math", "text", "convert", "task", "io"];

pub fn register_module(env: &RuntimeEnv, module: &str) {
    match module {
        "math" => register_math(env),
        "text" => register_text(env),
        "convert" => register_convert(env),
        "task" => register_task(env),
        "io" => register_io(env),
        _ => {}
    }
}

// ── Argument helpers ─────────────────────────────────────────────────────────

fn want_f64(args: &[Value], i: usize) -> Result<f64, String> {
    args[i]
        .as_f64()
        .ok_or_else(|| format!("argument {} must be numeric, got {}", i + 1, args[i].type_name()))
}

fn want_str(args: &[Value], i: usize) -> Result<Arc<str>, String> {
    match &args[i] {
        Value::Str(s) => Ok(Arc::clone(s)),
        other => Err(format!(
            "argument {} must be a string, got {}",
            i + 1,
            other.type_name()
        )),
    }
}

fn host(f: fn(&[Value]) -> Result<Value, String>) -> HostFn {
    Arc::new(f)
}

// ── math ─────────────────────────────────────────────────────────────────────

fn register_math(env: &RuntimeEnv) {
    let v = ReturnKind::Value;
    env.register_host("Math.Sqrt", 1, v, host(|a| Ok(Value::F64(want_f64(a, 0)?.sqrt()))));
    env.register_host("Math.Abs", 1, v, host(|a| {
        Ok(match &a[0] {
            Value::I32(n) => Value::I32(n.wrapping_abs()),
            Value::I64(n) => Value::I64(n.wrapping_abs()),
            other => Value::F64(
                other
                    .as_f64()
                    .ok_or_else(|| format!("argument 1 must be numeric, got {}", other.type_name()))?
                    .abs(),
            ),
        })
    }));
    env.register_host("Math.Floor", 1, v, host(|a| Ok(Value::F64(want_f64(a, 0)?.floor()))));
    env.register_host("Math.Ceil", 1, v, host(|a| Ok(Value::F64(want_f64(a, 0)?.ceil()))));
    env.register_host("Math.Pow", 2, v, host(|a| {
        Ok(Value::F64(want_f64(a, 0)?.powf(want_f64(a, 1)?)))
    }));
    env.register_host("Math.Min", 2, v, host(|a| {
        Ok(Value::F64(want_f64(a, 0)?.min(want_f64(a, 1)?)))
    }));
    env.register_host("Math.Max", 2, v, host(|a| {
        Ok(Value::F64(want_f64(a, 0)?.max(want_f64(a, 1)?)))
    }));
    env.register_host("Math.Sin", 1, v, host(|a| Ok(Value::F64(want_f64(a, 0)?.sin()))));
    env.register_host("Math.Cos", 1, v, host(|a| Ok(Value::F64(want_f64(a, 0)?.cos()))));
    env.register_host("Math.Pi", 0, v, host(|_| Ok(Value::F64(std::f64::consts::PI))));
}

// ── text ─────────────────────────────────────────────────────────────────────

fn register_text(env: &RuntimeEnv) {
    let v = ReturnKind::Value;
    env.register_host("Text.Length", 1, v, host(|a| {
        Ok(Value::I64(want_str(a, 0)?.chars().count() as i64))
    }));
    env.register_host("Text.Upper", 1, v, host(|a| {
        Ok(Value::Str(Arc::from(want_str(a, 0)?.to_uppercase().as_str())))
    }));
    env.register_host("Text.Lower", 1, v, host(|a| {
        Ok(Value::Str(Arc::from(want_str(a, 0)?.to_lowercase().as_str())))
    }));
    env.register_host("Text.Trim", 1, v, host(|a| {
        Ok(Value::Str(Arc::from(want_str(a, 0)?.trim())))
    }));
    env.register_host("Text.Split", 2, v, host(|a| {
        let s = want_str(a, 0)?;
        let sep = want_str(a, 1)?;
        let parts: Vec<Value> = s
            .split(sep.as_ref())
            .map(|p| Value::Str(Arc::from(p)))
            .collect();
        Ok(Value::Array(Arc::new(parking_lot::Mutex::new(parts))))
    }));
    env.register_host("Text.Contains", 2, v, host(|a| {
        Ok(Value::Bool(want_str(a, 0)?.contains(want_str(a, 1)?.as_ref())))
    }));
    env.register_host("Text.Replace", 3, v, host(|a| {
        let s = want_str(a, 0)?;
        let from = want_str(a, 1)?;
        let to = want_str(a, 2)?;
        Ok(Value::Str(Arc::from(
            s.replace(from.as_ref(), to.as_ref()).as_str(),
        )))
    }));
}

// ── convert ──────────────────────────────────────────────────────────────────

fn register_convert(env: &RuntimeEnv) {
    let v = ReturnKind::Value;
    env.register_host("Convert.ToInt", 1, v, host(|a| {
        match &a[0] {
            Value::I32(n) => Ok(Value::I64(*n as i64)),
            Value::I64(n) => Ok(Value::I64(*n)),
            Value::F32(x) => Ok(Value::I64(*x as i64)),
            Value::F64(x) => Ok(Value::I64(*x as i64)),
            Value::Bool(b) => Ok(Value::I64(*b as i64)),
            Value::Str(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::I64)
                .map_err(|_| format!("'{}' is not an integer", s)),
            other => Err(format!("cannot convert {} to int", other.type_name())),
        }
    }));
    env.register_host("Convert.ToFloat", 1, v, host(|a| {
        match &a[0] {
            Value::Str(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::F64)
                .map_err(|_| format!("'{}' is not a number", s)),
            other => other
                .as_f64()
                .map(Value::F64)
                .ok_or_else(|| format!("cannot convert {} to float", other.type_name())),
        }
    }));
    env.register_host("Convert.ToString", 1, v, host(|a| {
        Ok(Value::Str(Arc::from(a[0].display().as_str())))
    }));
    env.register_host("Convert.ToBool", 1, v, host(|a| {
        Ok(Value::Bool(a[0].coerce_to_bool()))
    }));
    env.register_host("Convert.TypeName", 1, v, host(|a| {
        Ok(Value::Str(Arc::from(a[0].type_name())))
    }));
}

// ── task ─────────────────────────────────────────────────────────────────────

fn register_task(env: &RuntimeEnv) {
    let v = ReturnKind::Value;
    env.register_host("Task.Await", 1, v, host(|a| {
        match &a[0] {
            Value::Future(handle) => handle.join().map_err(|fault| fault.display()),
            other => Err(format!("Await expects a future, got {}", other.type_name())),
        }
    }));
    env.register_host("Task.IsDone", 1, v, host(|a| {
        match &a[0] {
            Value::Future(handle) => Ok(Value::Bool(handle.is_done())),
            other => Err(format!("IsDone expects a future, got {}", other.type_name())),
        }
    }));
    env.register_host("Task.Cancel", 1, ReturnKind::Void, host(|a| {
        match &a[0] {
            Value::Future(handle) => {
                handle.cancel();
                Ok(Value::Null)
            }
            other => Err(format!("Cancel expects a future, got {}", other.type_name())),
        }
    }));
}

// ── io ───────────────────────────────────────────────────────────────────────

fn register_io(env: &RuntimeEnv) {
    env.register_host("Io.Print", 1, ReturnKind::Void, host(|a| {
        print!("{}", a[0].display());
        Ok(Value::Null)
    }));
    env.register_host("Io.PrintLine", 1, ReturnKind::Void, host(|a| {
        println!("{}", a[0].display());
        Ok(Value::Null)
    }));
    env.register_host("Io.ReadLine", 0, ReturnKind::Value, host(|_| {
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(_) => Ok(Value::Str(Arc::from(line.trim_end_matches(['\r', '\n'])))),
            Err(e) => Err(e.to_string()),
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn math_sqrt_resolves_and_computes() {
        let env = RuntimeEnv::new(0);
        register_module(&env, "math");
        let (idx, _) = env.lookup_host("Math.Sqrt").unwrap();
        let out = env.call_host(idx, &[Value::F64(16.0)]).unwrap();
        assert!(matches!(out, Some(Value::F64(x)) if x == 4.0));
    }

    #[test]
    fn bare_name_reaches_qualified_registration() {
        let env = RuntimeEnv::new(0);
        register_module(&env, "math");
        let (_, h) = env.lookup_host("Sqrt").unwrap();
        assert_eq!(h.name, "Math.Sqrt");
    }

    #[test]
    fn convert_to_int_parses_strings() {
        let env = RuntimeEnv::new(0);
        register_module(&env, "convert");
        let (idx, _) = env.lookup_host("Convert.ToInt").unwrap();
        let out = env.call_host(idx, &[Value::Str(" 42 ".into())]).unwrap();
        assert!(matches!(out, Some(Value::I64(42))));
        assert!(env.call_host(idx, &[Value::Str("nope".into())]).is_err());
    }

    #[test]
    fn io_module_registers_under_its_capitalized_prefix() {
        let env = RuntimeEnv::new(0);
        register_module(&env, "io");
        assert!(env.lookup_host("Io.Print").is_some());
        assert!(env.lookup_host("Io.PrintLine").is_some());
        let (_, h) = env.lookup_host("ReadLine").unwrap();
        assert_eq!(h.name, "Io.ReadLine");
    }

    #[test]
    fn void_host_pushes_nothing() {
        let env = RuntimeEnv::new(0);
        register_module(&env, "task");
        let (idx, h) = env.lookup_host("Task.Cancel").unwrap();
        assert_eq!(h.return_kind, ReturnKind::Void);
        // wrong operand kind still errors properly
        assert!(env.call_host(idx, &[Value::Null]).is_err());
    }
}
