//! Host function registry and the default builtin set.
//!
//! The registry maps global names to values and is seeded into the VM's
//! globals before execution. `print` and `input` go through a cloneable
//! `Console` handle so embedders and tests own all I/O; the VM itself never
//! touches stdout or stdin.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::Write;
use std::rc::Rc;

use crate::value::{Builtin, RangeValue, Value};
use crate::vm::ErrorKind;

enum Output {
    Stdout,
    Capture(Vec<String>),
}

enum Input {
    Stdin,
    Script(VecDeque<String>),
}

/// Where `print` writes and `input` reads. Clones share the same buffers.
#[derive(Clone)]
pub struct Console {
    output: Rc<RefCell<Output>>,
    input: Rc<RefCell<Input>>,
}

impl Console {
    pub fn stdio() -> Self {
        Self {
            output: Rc::new(RefCell::new(Output::Stdout)),
            input: Rc::new(RefCell::new(Input::Stdin)),
        }
    }

    /// Captures printed lines in memory; used by tests and the harness.
    pub fn capture() -> Self {
        Self {
            output: Rc::new(RefCell::new(Output::Capture(Vec::new()))),
            input: Rc::new(RefCell::new(Input::Script(VecDeque::new()))),
        }
    }

    /// Queues lines for `input` to consume instead of reading stdin.
    pub fn feed_input(&self, lines: impl IntoIterator<Item = String>) {
        let mut input = self.input.borrow_mut();
        match &mut *input {
            Input::Script(queue) => queue.extend(lines),
            Input::Stdin => {
                *input = Input::Script(lines.into_iter().collect());
            }
        }
    }

    pub fn print_line(&self, line: &str) {
        match &mut *self.output.borrow_mut() {
            Output::Stdout => println!("{line}"),
            Output::Capture(lines) => lines.push(line.to_string()),
        }
    }

    fn prompt(&self, text: &str) {
        if let Output::Stdout = &*self.output.borrow() {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
    }

    fn read_line(&self) -> String {
        match &mut *self.input.borrow_mut() {
            Input::Stdin => {
                let mut line = String::new();
                if std::io::stdin().read_line(&mut line).is_err() {
                    return String::new();
                }
                line.trim_end_matches(['\n', '\r']).to_string()
            }
            Input::Script(queue) => queue.pop_front().unwrap_or_default(),
        }
    }

    /// Everything printed so far, one string per line. Empty in stdio mode.
    pub fn captured(&self) -> Vec<String> {
        match &*self.output.borrow() {
            Output::Stdout => Vec::new(),
            Output::Capture(lines) => lines.clone(),
        }
    }
}

/// Named host callables handed to the VM as its initial global environment.
pub struct Registry {
    entries: Vec<(String, Value)>,
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registers a host function. `arity` of `None` accepts any argument
    /// count; `Some(n)` is enforced by the VM before the call.
    pub fn register<F>(&mut self, name: &str, arity: Option<usize>, func: F)
    where
        F: Fn(&[Value]) -> Result<Value, ErrorKind> + 'static,
    {
        self.entries.push((
            name.to_string(),
            Value::Builtin(Rc::new(Builtin {
                name: name.to_string(),
                arity,
                func: Box::new(func),
            })),
        ));
    }

    pub fn define(&mut self, name: &str, value: Value) {
        self.entries.push((name.to_string(), value));
    }

    pub fn into_entries(self) -> Vec<(String, Value)> {
        self.entries
    }

    /// The default builtin set plus the math constants the standard library
    /// expects, writing through `console`.
    pub fn standard(console: &Console) -> Self {
        let mut registry = Self::empty();

        let out = console.clone();
        registry.register("print", None, move |args| {
            let rendered: Vec<String> = args.iter().map(|value| value.to_string()).collect();
            out.print_line(&rendered.join(" "));
            Ok(Value::Null)
        });

        let io = console.clone();
        registry.register("input", None, move |args| {
            if let Some(prompt) = args.first() {
                io.prompt(&prompt.to_string());
            }
            Ok(Value::string(io.read_line()))
        });

        registry.register("len", Some(1), |args| match &args[0] {
            Value::Str(value) => Ok(Value::Number(value.chars().count() as f64)),
            Value::Array(values) => Ok(Value::Number(values.borrow().len() as f64)),
            Value::Object(entries) => Ok(Value::Number(entries.borrow().len() as f64)),
            _ => Ok(Value::Number(0.0)),
        });

        registry.register("range", None, |args| {
            let bound = |value: &Value, position: &str| match value {
                Value::Number(n) => Ok(*n),
                other => Err(ErrorKind::Type(format!(
                    "range {position} must be a number, not {}",
                    other.type_name()
                ))),
            };
            let (start, end, step) = match args {
                [end] => (0.0, bound(end, "end")?, 1.0),
                [start, end] => (bound(start, "start")?, bound(end, "end")?, 1.0),
                [start, end, step] => (
                    bound(start, "start")?,
                    bound(end, "end")?,
                    bound(step, "step")?,
                ),
                _ => {
                    return Err(ErrorKind::Arity(format!(
                        "'range' expected 1 to 3 arguments, got {}",
                        args.len()
                    )));
                }
            };
            if step == 0.0 {
                return Err(ErrorKind::Type("range step must not be zero".to_string()));
            }
            Ok(Value::Range(Rc::new(RangeValue { start, end, step })))
        });

        registry.register("string", Some(1), |args| {
            Ok(Value::string(args[0].to_string()))
        });

        registry.register("number", Some(1), |args| match &args[0] {
            Value::Number(value) => Ok(Value::Number(*value)),
            Value::Bool(value) => Ok(Value::Number(if *value { 1.0 } else { 0.0 })),
            // Lenient conversion: unparseable text reads as null.
            Value::Str(value) => Ok(value
                .trim()
                .parse::<f64>()
                .map(Value::Number)
                .unwrap_or(Value::Null)),
            _ => Ok(Value::Null),
        });

        registry.register("boolean", Some(1), |args| {
            Ok(Value::Bool(args[0].is_truthy()))
        });

        math_unary(&mut registry, "abs", f64::abs);
        math_unary(&mut registry, "sqrt", f64::sqrt);
        math_unary(&mut registry, "floor", f64::floor);
        math_unary(&mut registry, "ceil", f64::ceil);
        math_unary(&mut registry, "round", f64::round);
        math_unary(&mut registry, "sin", f64::sin);
        math_unary(&mut registry, "cos", f64::cos);
        math_unary(&mut registry, "tan", f64::tan);

        registry.register("pow", Some(2), |args| match (&args[0], &args[1]) {
            (Value::Number(base), Value::Number(exp)) => Ok(Value::Number(base.powf(*exp))),
            _ => Err(ErrorKind::Type(
                "'pow' expects two numbers".to_string(),
            )),
        });

        registry.register("min", None, |args| fold_extremum(args, "min", f64::min));
        registry.register("max", None, |args| fold_extremum(args, "max", f64::max));

        registry.define("pi", Value::Number(std::f64::consts::PI));
        registry.define("e", Value::Number(std::f64::consts::E));

        // Hooks behind the reserved syntax. Hosts overwrite these to give
        // `import`, `scene` and `web.app` real behaviour.
        registry.register("__import", Some(1), |args| {
            tracing::warn!(module = %args[0], "import is not wired to a host; returning an empty module");
            Ok(Value::object(indexmap::IndexMap::new()))
        });
        registry.register("__scene", Some(2), |args| {
            tracing::debug!(scene = %args[0], "scene declaration ignored by the core runtime");
            Ok(Value::Null)
        });
        registry.register("__route", Some(2), |args| {
            tracing::debug!(path = %args[0], "route declaration ignored by the core runtime");
            Ok(Value::Null)
        });

        registry
    }
}

fn math_unary(registry: &mut Registry, name: &'static str, apply: fn(f64) -> f64) {
    registry.register(name, Some(1), move |args| match &args[0] {
        Value::Number(value) => Ok(Value::Number(apply(*value))),
        other => Err(ErrorKind::Type(format!(
            "'{name}' expects a number, not {}",
            other.type_name()
        ))),
    });
}

fn fold_extremum(
    args: &[Value],
    name: &str,
    pick: fn(f64, f64) -> f64,
) -> Result<Value, ErrorKind> {
    if args.is_empty() {
        return Err(ErrorKind::Arity(format!(
            "'{name}' expected at least 1 argument, got 0"
        )));
    }
    let mut best: Option<f64> = None;
    for arg in args {
        match arg {
            Value::Number(value) => {
                best = Some(match best {
                    Some(current) => pick(current, *value),
                    None => *value,
                });
            }
            other => {
                return Err(ErrorKind::Type(format!(
                    "'{name}' expects numbers, not {}",
                    other.type_name()
                )));
            }
        }
    }
    Ok(Value::Number(best.expect("non-empty arguments")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard() -> (Console, Vec<(String, Value)>) {
        let console = Console::capture();
        let registry = Registry::standard(&console);
        (console, registry.into_entries())
    }

    fn lookup<'e>(entries: &'e [(String, Value)], name: &str) -> &'e Value {
        &entries
            .iter()
            .find(|(entry_name, _)| entry_name == name)
            .unwrap_or_else(|| panic!("builtin '{name}' not registered"))
            .1
    }

    fn call(entries: &[(String, Value)], name: &str, args: &[Value]) -> Result<Value, ErrorKind> {
        match lookup(entries, name) {
            Value::Builtin(builtin) => (builtin.func)(args),
            other => panic!("'{name}' is not a builtin: {other:?}"),
        }
    }

    #[test]
    fn default_set_covers_the_documented_names() {
        let (_, entries) = standard();
        for name in [
            "print", "input", "len", "range", "string", "number", "boolean", "abs", "sqrt",
            "pow", "min", "max", "floor", "ceil", "round",
        ] {
            lookup(&entries, name);
        }
    }

    #[test]
    fn print_joins_arguments_with_spaces() {
        let (console, entries) = standard();
        call(
            &entries,
            "print",
            &[Value::string("a"), Value::Number(1.0), Value::Bool(true)],
        )
        .expect("print should succeed");
        assert_eq!(console.captured(), vec!["a 1 true".to_string()]);
    }

    #[test]
    fn input_consumes_scripted_lines() {
        let (console, entries) = standard();
        console.feed_input(["hello".to_string()]);
        let value = call(&entries, "input", &[]).expect("input should succeed");
        assert_eq!(value.to_string(), "hello");
        let empty = call(&entries, "input", &[]).expect("input should succeed");
        assert_eq!(empty.to_string(), "");
    }

    #[test]
    fn len_counts_strings_arrays_and_objects() {
        let (_, entries) = standard();
        assert_eq!(
            call(&entries, "len", &[Value::string("abc")])
                .unwrap()
                .to_string(),
            "3"
        );
        assert_eq!(
            call(&entries, "len", &[Value::array(vec![Value::Null; 4])])
                .unwrap()
                .to_string(),
            "4"
        );
        assert_eq!(
            call(&entries, "len", &[Value::Number(9.0)])
                .unwrap()
                .to_string(),
            "0"
        );
    }

    #[test]
    fn number_conversion_is_lenient() {
        let (_, entries) = standard();
        assert_eq!(
            call(&entries, "number", &[Value::string("2.5")])
                .unwrap()
                .to_string(),
            "2.5"
        );
        assert!(matches!(
            call(&entries, "number", &[Value::string("nope")]).unwrap(),
            Value::Null
        ));
    }

    #[test]
    fn range_validates_its_arguments() {
        let (_, entries) = standard();
        assert!(matches!(
            call(&entries, "range", &[Value::Number(3.0)]).unwrap(),
            Value::Range(_)
        ));
        let err = call(
            &entries,
            "range",
            &[Value::Number(0.0), Value::Number(3.0), Value::Number(0.0)],
        )
        .expect_err("zero step should fail");
        assert!(matches!(err, ErrorKind::Type(_)));
    }

    #[test]
    fn min_and_max_are_variadic() {
        let (_, entries) = standard();
        let args = [Value::Number(3.0), Value::Number(-1.0), Value::Number(2.0)];
        assert_eq!(call(&entries, "min", &args).unwrap().to_string(), "-1");
        assert_eq!(call(&entries, "max", &args).unwrap().to_string(), "3");
    }
}
