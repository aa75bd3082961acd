//! Runtime values.
//!
//! A single tagged enum covers every value a program can observe; all type
//! tests happen at opcode time in the VM. `Number`, `Bool` and `Null` copy
//! by value, strings are immutable and shared, and every other variant is a
//! reference type compared by identity. `Bound` and `Iter` never come from
//! literals: the VM materialises them for method calls and `for` loops.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode::CodeObject;

#[derive(Debug, Clone)]
pub enum Value {
    Number(f64),
    Str(Rc<str>),
    Bool(bool),
    Null,
    Array(Rc<RefCell<Vec<Value>>>),
    Object(Rc<RefCell<IndexMap<String, Value>>>),
    Function(Rc<Closure>),
    Builtin(Rc<Builtin>),
    Class(Rc<ClassValue>),
    Instance(Rc<RefCell<InstanceValue>>),
    Range(Rc<RangeValue>),
    Bound(Rc<BoundMethod>),
    Iter(Rc<RefCell<IterState>>),
}

/// A captured variable cell, shared between the frame that owns the local
/// and every closure capturing it. The VM closes the cell (moves the value
/// in) when the owning frame exits.
#[derive(Debug)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct Closure {
    pub code: Rc<CodeObject>,
    pub upvalues: Vec<Rc<RefCell<Upvalue>>>,
}

pub struct Builtin {
    pub name: String,
    /// Advisory parameter count; `None` means variadic.
    pub arity: Option<usize>,
    pub func: BuiltinFn,
}

pub type BuiltinFn = Box<dyn Fn(&[Value]) -> Result<Value, crate::vm::ErrorKind>>;

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<builtin {}>", self.name)
    }
}

#[derive(Debug)]
pub struct ClassValue {
    pub name: String,
    pub methods: IndexMap<String, Value>,
    pub base: Option<Rc<ClassValue>>,
}

impl ClassValue {
    /// Walks the base chain for the named method.
    pub fn find_method(&self, name: &str) -> Option<Value> {
        if let Some(method) = self.methods.get(name) {
            return Some(method.clone());
        }
        self.base.as_ref().and_then(|base| base.find_method(name))
    }
}

#[derive(Debug)]
pub struct InstanceValue {
    pub class: Rc<ClassValue>,
    pub fields: IndexMap<String, Value>,
}

#[derive(Debug, Clone, Copy)]
pub struct RangeValue {
    pub start: f64,
    pub end: f64,
    pub step: f64,
}

#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Rc<Closure>,
}

#[derive(Debug)]
pub enum IterState {
    Array {
        values: Rc<RefCell<Vec<Value>>>,
        index: usize,
    },
    /// Object keys are snapshotted at `GET_ITER` in insertion order.
    Keys { keys: Vec<String>, index: usize },
    Chars { chars: Vec<char>, index: usize },
    Range { current: f64, end: f64, step: f64 },
}

impl IterState {
    pub fn next(&mut self) -> Option<Value> {
        match self {
            Self::Array { values, index } => {
                let value = values.borrow().get(*index).cloned();
                if value.is_some() {
                    *index += 1;
                }
                value
            }
            Self::Keys { keys, index } => {
                let key = keys.get(*index).cloned();
                if key.is_some() {
                    *index += 1;
                }
                key.map(Value::string)
            }
            Self::Chars { chars, index } => {
                let ch = chars.get(*index).copied();
                if ch.is_some() {
                    *index += 1;
                }
                ch.map(|c| Value::string(c.to_string()))
            }
            Self::Range { current, end, step } => {
                let more = if *step >= 0.0 { *current < *end } else { *current > *end };
                if !more {
                    return None;
                }
                let value = *current;
                *current += *step;
                Some(Value::Number(value))
            }
        }
    }
}

impl Value {
    pub fn string(value: impl Into<String>) -> Self {
        Self::Str(Rc::from(value.into()))
    }

    pub fn array(values: Vec<Value>) -> Self {
        Self::Array(Rc::new(RefCell::new(values)))
    }

    pub fn object(entries: IndexMap<String, Value>) -> Self {
        Self::Object(Rc::new(RefCell::new(entries)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Number(_) => "number",
            Self::Str(_) => "string",
            Self::Bool(_) => "boolean",
            Self::Null => "null",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Function(_) => "function",
            Self::Builtin(_) => "builtin",
            Self::Class(_) => "class",
            Self::Instance(_) => "instance",
            Self::Range(_) => "range",
            Self::Bound(_) => "method",
            Self::Iter(_) => "iterator",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(value) => *value,
            Self::Null => false,
            Self::Number(value) => *value != 0.0,
            Self::Str(value) => !value.is_empty(),
            Self::Array(values) => !values.borrow().is_empty(),
            Self::Object(entries) => !entries.borrow().is_empty(),
            _ => true,
        }
    }

    /// Language `==`: numbers by IEEE value (so `NaN == NaN` is false),
    /// strings by content, booleans and null by value, reference types by
    /// identity.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Null, Self::Null) => true,
            (Self::Array(a), Self::Array(b)) => Rc::ptr_eq(a, b),
            (Self::Object(a), Self::Object(b)) => Rc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (Self::Builtin(a), Self::Builtin(b)) => Rc::ptr_eq(a, b),
            (Self::Class(a), Self::Class(b)) => Rc::ptr_eq(a, b),
            (Self::Instance(a), Self::Instance(b)) => Rc::ptr_eq(a, b),
            (Self::Range(a), Self::Range(b)) => Rc::ptr_eq(a, b),
            (Self::Bound(a), Self::Bound(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Decimal text of a number: integral values print without a fraction, and
/// the IEEE specials print as `inf`/`-inf`/`nan`. String concatenation with
/// `+` uses the same form.
pub fn format_number(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{}", format_number(*value)),
            Self::Str(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Null => write!(f, "null"),
            Self::Array(values) => {
                let rendered: Vec<String> = values
                    .borrow()
                    .iter()
                    .map(|value| value.to_string())
                    .collect();
                write!(f, "[{}]", rendered.join(", "))
            }
            Self::Object(entries) => {
                let rendered: Vec<String> = entries
                    .borrow()
                    .iter()
                    .map(|(key, value)| format!("{key}: {value}"))
                    .collect();
                write!(f, "{{{}}}", rendered.join(", "))
            }
            Self::Function(closure) => write!(f, "<function {}>", closure.code.name),
            Self::Builtin(builtin) => write!(f, "<builtin {}>", builtin.name),
            Self::Class(class) => write!(f, "<class {}>", class.name),
            Self::Instance(instance) => {
                write!(f, "<{} instance>", instance.borrow().class.name)
            }
            Self::Range(range) => {
                write!(
                    f,
                    "range({}, {})",
                    format_number(range.start),
                    format_number(range.end)
                )
            }
            Self::Bound(bound) => write!(f, "<bound method {}>", bound.method.code.name),
            Self::Iter(_) => write!(f, "<iterator>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_matches_the_falsy_set() {
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(!Value::string("").is_truthy());
        assert!(!Value::array(vec![]).is_truthy());
        assert!(!Value::object(IndexMap::new()).is_truthy());

        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Number(-1.0).is_truthy());
        assert!(Value::string("x").is_truthy());
        assert!(Value::array(vec![Value::Null]).is_truthy());
    }

    #[test]
    fn nan_is_not_equal_to_itself() {
        let nan = Value::Number(f64::NAN);
        assert!(!nan.equals(&nan));
        assert!(Value::Number(2.0).equals(&Value::Number(2.0)));
    }

    #[test]
    fn strings_compare_by_content_arrays_by_identity() {
        assert!(Value::string("abc").equals(&Value::string("abc")));
        let a = Value::array(vec![Value::Number(1.0)]);
        let b = Value::array(vec![Value::Number(1.0)]);
        assert!(!a.equals(&b));
        assert!(a.equals(&a.clone()));
    }

    #[test]
    fn numbers_format_without_trailing_fraction() {
        assert_eq!(format_number(30.0), "30");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(f64::INFINITY), "inf");
        assert_eq!(format_number(f64::NEG_INFINITY), "-inf");
        assert_eq!(format_number(f64::NAN), "nan");
    }

    #[test]
    fn display_renders_aggregates() {
        let mut entries = IndexMap::new();
        entries.insert("a".to_string(), Value::Number(1.0));
        entries.insert("b".to_string(), Value::string("x"));
        let object = Value::object(entries);
        assert_eq!(object.to_string(), "{a: 1, b: x}");

        let array = Value::array(vec![Value::Number(1.0), Value::Bool(true), Value::Null]);
        assert_eq!(array.to_string(), "[1, true, null]");
    }

    #[test]
    fn range_iterator_yields_integers_in_order() {
        let mut iter = IterState::Range {
            current: 1.0,
            end: 4.0,
            step: 1.0,
        };
        let mut collected = Vec::new();
        while let Some(value) = iter.next() {
            collected.push(value.to_string());
        }
        assert_eq!(collected, vec!["1", "2", "3"]);
    }

    #[test]
    fn object_key_iteration_preserves_insertion_order() {
        let mut iter = IterState::Keys {
            keys: vec!["z".to_string(), "a".to_string(), "m".to_string()],
            index: 0,
        };
        let mut collected = Vec::new();
        while let Some(value) = iter.next() {
            collected.push(value.to_string());
        }
        assert_eq!(collected, vec!["z", "a", "m"]);
    }
}
