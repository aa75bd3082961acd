//! Stack virtual machine.
//!
//! Execution keeps an explicit call-frame vector instead of recursing on the
//! host stack, so script recursion is bounded only by `MAX_CALL_DEPTH`. Each
//! frame owns a base pointer into the shared value stack (local slot 0), a
//! handler stack for active `try` regions, and the closure being run.
//! Captured variables live in `Upvalue` cells that stay open (pointing at a
//! stack slot) while the owning frame is alive and are closed on frame exit.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;
use thiserror::Error;

use crate::builtins::Registry;
use crate::bytecode::{CodeObject, Constant, Op};
use crate::token::Span;
use crate::value::{
    BoundMethod, ClassValue, Closure, InstanceValue, IterState, Upvalue, Value, format_number,
};

/// Documented VM limit on nested calls.
pub const MAX_CALL_DEPTH: usize = 4096;

#[derive(Debug, Clone)]
pub enum ErrorKind {
    Type(String),
    Name(String),
    Index(String),
    Key(String),
    Arity(String),
    /// A value raised by `throw`.
    Thrown(Value),
    StackOverflow,
    /// Bytecode invariant violation (corrupt image, emitter bug).
    Internal(String),
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Type(_) => "TypeError",
            Self::Name(_) => "NameError",
            Self::Index(_) => "IndexError",
            Self::Key(_) => "KeyError",
            Self::Arity(_) => "ArityError",
            Self::Thrown(_) => "Error",
            Self::StackOverflow => "StackOverflowError",
            Self::Internal(_) => "InternalError",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Type(message)
            | Self::Name(message)
            | Self::Index(message)
            | Self::Key(message)
            | Self::Arity(message)
            | Self::Internal(message) => message.clone(),
            Self::Thrown(value) => value.to_string(),
            Self::StackOverflow => format!("Call depth exceeded the limit of {MAX_CALL_DEPTH}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub function: String,
    pub span: Span,
}

/// Runtime failure delivered to the embedder: what went wrong, where, and
/// the call stack captured at the throw site.
#[derive(Debug, Clone, Error)]
#[error("{}: {} at {span}", self.kind.label(), self.kind.message())]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub span: Span,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    /// Multi-line report with the captured call stack, innermost first.
    pub fn render(&self) -> String {
        let mut out = self.to_string();
        for frame in &self.trace {
            out.push_str(&format!("\n  in {} at {}", frame.function, frame.span));
        }
        out
    }
}

struct TryHandler {
    catch: Option<usize>,
    finally: Option<usize>,
    stack_len: usize,
}

struct Frame {
    closure: Rc<Closure>,
    ip: usize,
    /// Stack index of local slot 0; the callee sits one slot below.
    base: usize,
    handlers: Vec<TryHandler>,
    /// Set for constructor frames: the instance replaces the return value.
    ctor: Option<Value>,
}

enum Step {
    Continue,
    Done(Value),
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<Frame>,
    globals: HashMap<String, Value>,
    /// Cells still pointing at live stack slots, with their slot index.
    open_upvalues: Vec<(usize, Rc<RefCell<Upvalue>>)>,
}

impl Vm {
    pub fn new(registry: Registry) -> Self {
        let mut globals = HashMap::new();
        for (name, value) in registry.into_entries() {
            globals.insert(name, value);
        }
        Self {
            stack: Vec::new(),
            frames: Vec::new(),
            globals,
            open_upvalues: Vec::new(),
        }
    }

    /// Installs or replaces a global binding before (or between) runs.
    pub fn define_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_string(), value);
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    /// Runs a compiled program to completion. Globals persist across calls,
    /// which the REPL relies on; the value stack does not.
    pub fn run(&mut self, code: &Rc<CodeObject>) -> Result<Value, RuntimeError> {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();

        tracing::debug!(code = %code.name, instructions = code.code.len(), "running code object");
        let closure = Rc::new(Closure {
            code: code.clone(),
            upvalues: Vec::new(),
        });
        self.stack.push(Value::Null); // callee slot of the top frame
        self.push_frame(closure, 1, 0, None)
            .map_err(|kind| RuntimeError {
                kind,
                span: Span::default(),
                trace: Vec::new(),
            })?;
        self.execute()
    }

    fn execute(&mut self) -> Result<Value, RuntimeError> {
        loop {
            let (op, span) = {
                let frame = self.frames.last_mut().expect("active frame");
                let ip = frame.ip;
                let code = &frame.closure.code;
                match code.code.get(ip) {
                    Some(op) => {
                        frame.ip += 1;
                        (op.clone(), code.span_at(ip))
                    }
                    None => (Op::Return, code.span_at(ip.saturating_sub(1))),
                }
            };
            match self.step(op, span) {
                Ok(Step::Continue) => {}
                Ok(Step::Done(value)) => return Ok(value),
                Err(kind) => self.unwind(kind, span)?,
            }
        }
    }

    fn step(&mut self, op: Op, span: Span) -> Result<Step, ErrorKind> {
        match op {
            Op::LoadConst(index) => {
                let constant = {
                    let frame = self.frames.last().expect("active frame");
                    frame
                        .closure
                        .code
                        .consts
                        .get(index as usize)
                        .cloned()
                        .ok_or_else(|| internal("constant index out of range"))?
                };
                let value = match constant {
                    Constant::Number(value) => Value::Number(value),
                    Constant::Str(value) => Value::string(value),
                    Constant::Bool(value) => Value::Bool(value),
                    Constant::Null => Value::Null,
                    Constant::Code(_) => {
                        return Err(internal("code constant loaded outside MAKE_FUNCTION"));
                    }
                };
                self.stack.push(value);
            }
            Op::LoadLocal(slot) => {
                let base = self.base();
                let value = self
                    .stack
                    .get(base + slot as usize)
                    .cloned()
                    .ok_or_else(|| internal("local slot out of range"))?;
                self.stack.push(value);
            }
            Op::StoreLocal(slot) => {
                let base = self.base();
                let value = self.pop()?;
                let cell = self
                    .stack
                    .get_mut(base + slot as usize)
                    .ok_or_else(|| internal("local slot out of range"))?;
                *cell = value;
            }
            Op::LoadGlobal(name) => {
                let value = self
                    .globals
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| ErrorKind::Name(format!("'{name}' is not defined")))?;
                self.stack.push(value);
            }
            Op::StoreGlobal(name) => {
                let value = self.pop()?;
                self.globals.insert(name, value);
            }
            Op::LoadUpvalue(index) => {
                let cell = self.upvalue_cell(index)?;
                let value = match &*cell.borrow() {
                    Upvalue::Open(slot) => self
                        .stack
                        .get(*slot)
                        .cloned()
                        .ok_or_else(|| internal("open upvalue slot out of range"))?,
                    Upvalue::Closed(value) => value.clone(),
                };
                self.stack.push(value);
            }
            Op::StoreUpvalue(index) => {
                let cell = self.upvalue_cell(index)?;
                let value = self.pop()?;
                let mut borrowed = cell.borrow_mut();
                match &mut *borrowed {
                    Upvalue::Open(slot) => {
                        let slot = *slot;
                        drop(borrowed);
                        let target = self
                            .stack
                            .get_mut(slot)
                            .ok_or_else(|| internal("open upvalue slot out of range"))?;
                        *target = value;
                    }
                    Upvalue::Closed(closed) => *closed = value,
                }
            }
            Op::Pop => {
                self.pop()?;
            }
            Op::Dup => {
                let top = self
                    .stack
                    .last()
                    .cloned()
                    .ok_or_else(|| internal("stack underflow"))?;
                self.stack.push(top);
            }
            Op::Add => {
                let right = self.pop()?;
                let left = self.pop()?;
                let result = match (&left, &right) {
                    (Value::Number(a), Value::Number(b)) => Value::Number(a + b),
                    (Value::Str(a), Value::Str(b)) => Value::string(format!("{a}{b}")),
                    (Value::Str(a), Value::Number(b)) => {
                        Value::string(format!("{a}{}", format_number(*b)))
                    }
                    (Value::Number(a), Value::Str(b)) => {
                        Value::string(format!("{}{b}", format_number(*a)))
                    }
                    _ => {
                        return Err(ErrorKind::Type(format!(
                            "Cannot add {} and {}",
                            left.type_name(),
                            right.type_name()
                        )));
                    }
                };
                self.stack.push(result);
            }
            Op::Sub => self.numeric_binary("subtract", |a, b| a - b)?,
            Op::Mul => self.numeric_binary("multiply", |a, b| a * b)?,
            // IEEE semantics: dividing by zero yields an infinity or NaN.
            Op::Div => self.numeric_binary("divide", |a, b| a / b)?,
            // Floored modulo: the result takes the divisor's sign.
            Op::Mod => self.numeric_binary("take modulo of", |a, b| {
                let rem = a % b;
                if rem != 0.0 && (rem < 0.0) != (b < 0.0) {
                    rem + b
                } else {
                    rem
                }
            })?,
            Op::Pow => self.numeric_binary("exponentiate", f64::powf)?,
            Op::Neg => {
                let value = self.pop()?;
                match value {
                    Value::Number(value) => self.stack.push(Value::Number(-value)),
                    other => {
                        return Err(ErrorKind::Type(format!(
                            "Cannot negate {}",
                            other.type_name()
                        )));
                    }
                }
            }
            Op::Eq => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.stack.push(Value::Bool(left.equals(&right)));
            }
            Op::Ne => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.stack.push(Value::Bool(!left.equals(&right)));
            }
            Op::Lt => self.compare(|ord| ord == std::cmp::Ordering::Less)?,
            Op::Gt => self.compare(|ord| ord == std::cmp::Ordering::Greater)?,
            Op::Le => self.compare(|ord| ord != std::cmp::Ordering::Greater)?,
            Op::Ge => self.compare(|ord| ord != std::cmp::Ordering::Less)?,
            Op::Not => {
                let value = self.pop()?;
                self.stack.push(Value::Bool(!value.is_truthy()));
            }
            Op::Jump(offset) => self.jump(offset)?,
            Op::JumpIfFalse(offset) => {
                let value = self.pop()?;
                if !value.is_truthy() {
                    self.jump(offset)?;
                }
            }
            Op::JumpIfTrue(offset) => {
                let value = self.pop()?;
                if value.is_truthy() {
                    self.jump(offset)?;
                }
            }
            Op::Call(argc) => self.call(argc as usize)?,
            Op::Return => {
                let mut result = self.pop()?;
                let frame = self.frames.pop().expect("active frame");
                self.close_upvalues(frame.base);
                if let Some(instance) = frame.ctor {
                    // `new` evaluates to the instance no matter what the
                    // constructor returns.
                    result = instance;
                }
                self.stack.truncate(frame.base.saturating_sub(1));
                if self.frames.is_empty() {
                    return Ok(Step::Done(result));
                }
                self.stack.push(result);
            }
            Op::MakeFunction(index) => {
                let proto = {
                    let frame = self.frames.last().expect("active frame");
                    match frame.closure.code.consts.get(index as usize) {
                        Some(Constant::Code(code)) => code.clone(),
                        _ => return Err(internal("MAKE_FUNCTION operand is not code")),
                    }
                };
                let closure = self.make_closure(proto)?;
                self.stack.push(Value::Function(closure));
            }
            Op::MakeArray(count) => {
                let start = self
                    .stack
                    .len()
                    .checked_sub(count as usize)
                    .ok_or_else(|| internal("stack underflow"))?;
                let values = self.stack.split_off(start);
                self.stack.push(Value::array(values));
            }
            Op::MakeObject(count) => {
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    let Value::Str(key) = key else {
                        return Err(internal("object key is not a string"));
                    };
                    entries.push((key.to_string(), value));
                }
                entries.reverse();
                let mut map = IndexMap::with_capacity(entries.len());
                for (key, value) in entries {
                    map.insert(key, value);
                }
                self.stack.push(Value::object(map));
            }
            Op::GetMember(name) => {
                let object = self.pop()?;
                let value = self.get_member(&object, &name)?;
                self.stack.push(value);
            }
            Op::SetMember(name) => {
                let value = self.pop()?;
                let object = self.pop()?;
                match &object {
                    Value::Object(entries) => {
                        entries.borrow_mut().insert(name, value.clone());
                    }
                    Value::Instance(instance) => {
                        instance.borrow_mut().fields.insert(name, value.clone());
                    }
                    other => {
                        return Err(ErrorKind::Type(format!(
                            "Cannot set member '{name}' on {}",
                            other.type_name()
                        )));
                    }
                }
                self.stack.push(value);
            }
            Op::GetIndex => {
                let index = self.pop()?;
                let object = self.pop()?;
                let value = self.get_index(&object, &index)?;
                self.stack.push(value);
            }
            Op::SetIndex => {
                let value = self.pop()?;
                let index = self.pop()?;
                let object = self.pop()?;
                self.set_index(&object, &index, value.clone())?;
                self.stack.push(value);
            }
            Op::MakeClass {
                name,
                methods,
                has_base,
            } => {
                let mut table = IndexMap::with_capacity(methods.len());
                let mut popped = Vec::with_capacity(methods.len());
                for _ in 0..methods.len() {
                    popped.push(self.pop()?);
                }
                popped.reverse();
                for (method_name, value) in methods.into_iter().zip(popped) {
                    table.insert(method_name, value);
                }
                let base = if has_base {
                    match self.pop()? {
                        Value::Class(base) => Some(base),
                        other => {
                            return Err(ErrorKind::Type(format!(
                                "Base of class '{name}' must be a class, not {}",
                                other.type_name()
                            )));
                        }
                    }
                } else {
                    None
                };
                self.stack.push(Value::Class(Rc::new(ClassValue {
                    name,
                    methods: table,
                    base,
                })));
            }
            Op::New(argc) => {
                let argc = argc as usize;
                let class_index = self
                    .stack
                    .len()
                    .checked_sub(argc + 1)
                    .ok_or_else(|| internal("stack underflow"))?;
                let class = match self.stack[class_index].clone() {
                    Value::Class(class) => class,
                    other => {
                        return Err(ErrorKind::Type(format!(
                            "'new' expects a class, not {}",
                            other.type_name()
                        )));
                    }
                };
                self.construct(class, argc, class_index)?;
            }
            Op::LoadThis => {
                let base = self.base();
                let value = self
                    .stack
                    .get(base)
                    .cloned()
                    .ok_or_else(|| internal("missing 'this' slot"))?;
                self.stack.push(value);
            }
            Op::LoadSuper(name) => {
                let class = match self.pop()? {
                    Value::Class(class) => class,
                    other => {
                        return Err(ErrorKind::Type(format!(
                            "'super' expects a class, not {}",
                            other.type_name()
                        )));
                    }
                };
                let method = class.find_method(&name).ok_or_else(|| {
                    ErrorKind::Name(format!(
                        "Class '{}' has no method '{name}'",
                        class.name
                    ))
                })?;
                self.stack.push(method);
            }
            Op::PushTry { catch, finally } => {
                let stack_len = self.stack.len();
                let frame = self.frames.last_mut().expect("active frame");
                let ip = frame.ip as i64;
                let absolute = |offset: i32| (ip + offset as i64) as usize;
                frame.handlers.push(TryHandler {
                    catch: catch.map(absolute),
                    finally: finally.map(absolute),
                    stack_len,
                });
            }
            Op::PopTry => {
                let frame = self.frames.last_mut().expect("active frame");
                frame
                    .handlers
                    .pop()
                    .ok_or_else(|| internal("POP_TRY with no active handler"))?;
            }
            Op::Throw => {
                let value = self.pop()?;
                return Err(ErrorKind::Thrown(value));
            }
            Op::GetIter => {
                let value = self.pop()?;
                let iter = match &value {
                    Value::Array(values) => IterState::Array {
                        values: values.clone(),
                        index: 0,
                    },
                    Value::Object(entries) => IterState::Keys {
                        keys: entries.borrow().keys().cloned().collect(),
                        index: 0,
                    },
                    Value::Str(value) => IterState::Chars {
                        chars: value.chars().collect(),
                        index: 0,
                    },
                    Value::Range(range) => IterState::Range {
                        current: range.start,
                        end: range.end,
                        step: range.step,
                    },
                    other => {
                        return Err(ErrorKind::Type(format!(
                            "{} is not iterable",
                            other.type_name()
                        )));
                    }
                };
                self.stack.push(Value::Iter(Rc::new(RefCell::new(iter))));
            }
            Op::ForIter(offset) => {
                let next = {
                    let top = self
                        .stack
                        .last()
                        .ok_or_else(|| internal("stack underflow"))?;
                    let Value::Iter(iter) = top else {
                        return Err(internal("FOR_ITER without an iterator"));
                    };
                    iter.borrow_mut().next()
                };
                match next {
                    Some(value) => self.stack.push(value),
                    None => {
                        self.pop()?; // exhausted iterator
                        self.jump(offset)?;
                    }
                }
            }
        }
        Ok(Step::Continue)
    }

    // Call machinery.

    fn call(&mut self, argc: usize) -> Result<(), ErrorKind> {
        let callee_index = self
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or_else(|| internal("stack underflow"))?;
        let callee = self.stack[callee_index].clone();
        match callee {
            Value::Function(closure) => self.push_frame(closure, callee_index + 1, argc, None),
            Value::Builtin(builtin) => {
                let args = self.stack.split_off(callee_index + 1);
                self.stack.pop();
                if let Some(arity) = builtin.arity
                    && args.len() != arity
                {
                    return Err(ErrorKind::Arity(format!(
                        "'{}' expected {arity} argument{}, got {}",
                        builtin.name,
                        if arity == 1 { "" } else { "s" },
                        args.len()
                    )));
                }
                let result = (builtin.func)(&args)?;
                self.stack.push(result);
                Ok(())
            }
            // Calling a class is `new` with the same arguments.
            Value::Class(class) => self.construct(class, argc, callee_index),
            Value::Bound(bound) => {
                self.stack[callee_index] = Value::Function(bound.method.clone());
                self.stack
                    .insert(callee_index + 1, bound.receiver.clone());
                self.push_frame(bound.method.clone(), callee_index + 1, argc + 1, None)
            }
            other => Err(ErrorKind::Type(format!(
                "{} is not callable",
                other.type_name()
            ))),
        }
    }

    /// Frame entry per the call protocol: base points at the first argument,
    /// missing parameters fill with null, extra arguments are discarded, and
    /// the remaining declared locals get one reserved slot each.
    fn push_frame(
        &mut self,
        closure: Rc<Closure>,
        base: usize,
        argc: usize,
        ctor: Option<Value>,
    ) -> Result<(), ErrorKind> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(ErrorKind::StackOverflow);
        }
        let params = closure.code.params.len();
        if argc < params {
            for _ in argc..params {
                self.stack.push(Value::Null);
            }
        } else if argc > params {
            self.stack.truncate(base + params);
        }
        for _ in params..closure.code.locals.len() {
            self.stack.push(Value::Null);
        }
        self.frames.push(Frame {
            closure,
            ip: 0,
            base,
            handlers: Vec::new(),
            ctor,
        });
        Ok(())
    }

    fn construct(
        &mut self,
        class: Rc<ClassValue>,
        argc: usize,
        class_index: usize,
    ) -> Result<(), ErrorKind> {
        let instance = Value::Instance(Rc::new(RefCell::new(InstanceValue {
            class: class.clone(),
            fields: IndexMap::new(),
        })));
        match class.find_method("constructor") {
            Some(Value::Function(ctor)) => {
                // Rewrite [class, args...] into [ctor, this, args...] so the
                // constructor runs as an ordinary method call.
                self.stack[class_index] = Value::Function(ctor.clone());
                self.stack.insert(class_index + 1, instance.clone());
                self.push_frame(ctor, class_index + 1, argc + 1, Some(instance))
            }
            Some(other) => Err(ErrorKind::Type(format!(
                "Constructor of '{}' is not a function ({})",
                class.name,
                other.type_name()
            ))),
            None => {
                if argc > 0 {
                    return Err(ErrorKind::Arity(format!(
                        "Class '{}' has no constructor but was given {argc} argument{}",
                        class.name,
                        if argc == 1 { "" } else { "s" }
                    )));
                }
                self.stack.pop(); // the class itself
                self.stack.push(instance);
                Ok(())
            }
        }
    }

    fn make_closure(&mut self, proto: Rc<CodeObject>) -> Result<Rc<Closure>, ErrorKind> {
        let descriptors = proto.upvalues.clone();
        let mut upvalues = Vec::with_capacity(descriptors.len());
        for desc in descriptors {
            let cell = if desc.from_parent_local {
                let base = self.base();
                self.capture_upvalue(base + desc.index as usize)
            } else {
                self.upvalue_cell(desc.index)?
            };
            upvalues.push(cell);
        }
        Ok(Rc::new(Closure {
            code: proto,
            upvalues,
        }))
    }

    fn capture_upvalue(&mut self, slot: usize) -> Rc<RefCell<Upvalue>> {
        if let Some((_, cell)) = self
            .open_upvalues
            .iter()
            .find(|(open_slot, _)| *open_slot == slot)
        {
            return cell.clone();
        }
        let cell = Rc::new(RefCell::new(Upvalue::Open(slot)));
        self.open_upvalues.push((slot, cell.clone()));
        cell
    }

    /// Closes every open cell at or above `from`, moving the current stack
    /// value into the cell so captures outlive the frame.
    fn close_upvalues(&mut self, from: usize) {
        let mut kept = Vec::with_capacity(self.open_upvalues.len());
        for (slot, cell) in self.open_upvalues.drain(..) {
            if slot >= from {
                let value = self.stack.get(slot).cloned().unwrap_or(Value::Null);
                *cell.borrow_mut() = Upvalue::Closed(value);
            } else {
                kept.push((slot, cell));
            }
        }
        self.open_upvalues = kept;
    }

    // Member and index access.

    fn get_member(&self, object: &Value, name: &str) -> Result<Value, ErrorKind> {
        match object {
            // Dot access is lenient: a missing key reads as null.
            Value::Object(entries) => Ok(entries.borrow().get(name).cloned().unwrap_or(Value::Null)),
            Value::Instance(instance) => {
                let borrowed = instance.borrow();
                if let Some(value) = borrowed.fields.get(name) {
                    return Ok(value.clone());
                }
                match borrowed.class.find_method(name) {
                    Some(Value::Function(method)) => Ok(Value::Bound(Rc::new(BoundMethod {
                        receiver: object.clone(),
                        method,
                    }))),
                    Some(other) => Ok(other),
                    None => Ok(Value::Null),
                }
            }
            Value::Class(class) => Ok(class.find_method(name).unwrap_or(Value::Null)),
            other => Err(ErrorKind::Type(format!(
                "Cannot access member '{name}' of {}",
                other.type_name()
            ))),
        }
    }

    fn get_index(&self, object: &Value, index: &Value) -> Result<Value, ErrorKind> {
        match object {
            Value::Array(values) => {
                let position = array_position(index)?;
                // Out-of-range array reads yield null rather than raising.
                Ok(position
                    .and_then(|i| values.borrow().get(i).cloned())
                    .unwrap_or(Value::Null))
            }
            Value::Str(value) => {
                let position = array_position(index)?;
                Ok(position
                    .and_then(|i| value.chars().nth(i))
                    .map(|ch| Value::string(ch.to_string()))
                    .unwrap_or(Value::Null))
            }
            Value::Object(entries) => match index {
                // Bracket access is the strict form: a missing key raises.
                Value::Str(key) => entries
                    .borrow()
                    .get(key.as_ref())
                    .cloned()
                    .ok_or_else(|| ErrorKind::Key(format!("Object has no key '{key}'"))),
                other => Err(ErrorKind::Type(format!(
                    "Object keys are strings, not {}",
                    other.type_name()
                ))),
            },
            Value::Instance(instance) => match index {
                Value::Str(key) => instance
                    .borrow()
                    .fields
                    .get(key.as_ref())
                    .cloned()
                    .ok_or_else(|| ErrorKind::Key(format!("Instance has no field '{key}'"))),
                other => Err(ErrorKind::Type(format!(
                    "Instance fields are strings, not {}",
                    other.type_name()
                ))),
            },
            other => Err(ErrorKind::Type(format!(
                "{} is not indexable",
                other.type_name()
            ))),
        }
    }

    fn set_index(&self, object: &Value, index: &Value, value: Value) -> Result<(), ErrorKind> {
        match object {
            Value::Array(values) => {
                let len = values.borrow().len();
                let position = array_position(index)?
                    .filter(|i| *i < len)
                    .ok_or_else(|| {
                        ErrorKind::Index(format!(
                            "Array index {} out of bounds for length {len}",
                            index
                        ))
                    })?;
                values.borrow_mut()[position] = value;
                Ok(())
            }
            Value::Object(entries) => match index {
                Value::Str(key) => {
                    entries.borrow_mut().insert(key.to_string(), value);
                    Ok(())
                }
                other => Err(ErrorKind::Type(format!(
                    "Object keys are strings, not {}",
                    other.type_name()
                ))),
            },
            Value::Instance(instance) => match index {
                Value::Str(key) => {
                    instance.borrow_mut().fields.insert(key.to_string(), value);
                    Ok(())
                }
                other => Err(ErrorKind::Type(format!(
                    "Instance fields are strings, not {}",
                    other.type_name()
                ))),
            },
            other => Err(ErrorKind::Type(format!(
                "{} does not support index assignment",
                other.type_name()
            ))),
        }
    }

    // Small helpers.

    fn base(&self) -> usize {
        self.frames.last().expect("active frame").base
    }

    fn upvalue_cell(&self, index: u8) -> Result<Rc<RefCell<Upvalue>>, ErrorKind> {
        let frame = self.frames.last().expect("active frame");
        frame
            .closure
            .upvalues
            .get(index as usize)
            .cloned()
            .ok_or_else(|| internal("upvalue index out of range"))
    }

    fn pop(&mut self) -> Result<Value, ErrorKind> {
        self.stack.pop().ok_or_else(|| internal("stack underflow"))
    }

    fn jump(&mut self, offset: i32) -> Result<(), ErrorKind> {
        let frame = self.frames.last_mut().expect("active frame");
        let next = frame.ip as i64 + offset as i64;
        if next < 0 || next as usize > frame.closure.code.code.len() {
            return Err(internal("jump target out of range"));
        }
        frame.ip = next as usize;
        Ok(())
    }

    fn numeric_binary(
        &mut self,
        verb: &str,
        apply: impl Fn(f64, f64) -> f64,
    ) -> Result<(), ErrorKind> {
        let right = self.pop()?;
        let left = self.pop()?;
        match (&left, &right) {
            (Value::Number(a), Value::Number(b)) => {
                self.stack.push(Value::Number(apply(*a, *b)));
                Ok(())
            }
            _ => Err(ErrorKind::Type(format!(
                "Cannot {verb} {} and {}",
                left.type_name(),
                right.type_name()
            ))),
        }
    }

    fn compare(&mut self, accept: impl Fn(std::cmp::Ordering) -> bool) -> Result<(), ErrorKind> {
        let right = self.pop()?;
        let left = self.pop()?;
        let result = match (&left, &right) {
            (Value::Number(a), Value::Number(b)) => match a.partial_cmp(b) {
                Some(ordering) => accept(ordering),
                None => false, // NaN compares false everywhere
            },
            (Value::Str(a), Value::Str(b)) => accept(a.cmp(b)),
            _ => {
                return Err(ErrorKind::Type(format!(
                    "Cannot compare {} and {}",
                    left.type_name(),
                    right.type_name()
                )));
            }
        };
        self.stack.push(Value::Bool(result));
        Ok(())
    }

    // Unwinding.

    /// Walks handler stacks innermost-first. A handler restores the operand
    /// stack to its recorded depth, receives the raised value on the stack,
    /// and resumes at its catch target (or finally trailer, which rethrows).
    /// Frames without handlers pop with their upvalues closed.
    fn unwind(&mut self, kind: ErrorKind, span: Span) -> Result<(), RuntimeError> {
        let trace = self.capture_trace();
        let raised = raised_value(&kind, span);
        loop {
            let Some(frame) = self.frames.last_mut() else {
                return Err(RuntimeError { kind, span, trace });
            };
            if let Some(handler) = frame.handlers.pop() {
                let target = handler
                    .catch
                    .or(handler.finally)
                    .expect("handler carries a target");
                frame.ip = target;
                self.stack.truncate(handler.stack_len);
                self.stack.push(raised);
                return Ok(());
            }
            let frame = self.frames.pop().expect("frame present");
            self.close_upvalues(frame.base);
            self.stack.truncate(frame.base.saturating_sub(1));
        }
    }

    fn capture_trace(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| TraceFrame {
                function: frame.closure.code.name.clone(),
                span: frame.closure.code.span_at(frame.ip.saturating_sub(1)),
            })
            .collect()
    }
}

/// What a `catch` binding receives: thrown values pass through unchanged,
/// internal errors materialise as an inspectable object.
fn raised_value(kind: &ErrorKind, span: Span) -> Value {
    match kind {
        ErrorKind::Thrown(value) => value.clone(),
        other => {
            let mut entries = IndexMap::new();
            entries.insert("kind".to_string(), Value::string(other.label()));
            entries.insert("message".to_string(), Value::string(other.message()));
            entries.insert("line".to_string(), Value::Number(span.line as f64));
            Value::object(entries)
        }
    }
}

fn array_position(index: &Value) -> Result<Option<usize>, ErrorKind> {
    match index {
        Value::Number(value) => {
            if value.fract() != 0.0 || *value < 0.0 {
                return Ok(None);
            }
            Ok(Some(*value as usize))
        }
        other => Err(ErrorKind::Type(format!(
            "Index must be a number, not {}",
            other.type_name()
        ))),
    }
}

fn internal(message: &str) -> ErrorKind {
    ErrorKind::Internal(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::Console;
    use indoc::indoc;

    fn run_capture(source: &str) -> Vec<String> {
        let console = Console::capture();
        let code = crate::compile(source).expect("compile should succeed");
        let mut vm = Vm::new(Registry::standard(&console));
        vm.run(&code).expect("run should succeed");
        console.captured()
    }

    fn run_error(source: &str) -> RuntimeError {
        let console = Console::capture();
        let code = crate::compile(source).expect("compile should succeed");
        let mut vm = Vm::new(Registry::standard(&console));
        vm.run(&code).expect_err("run should fail")
    }

    #[test]
    fn adds_globals() {
        let output = run_capture("x = 10\ny = 20\nprint(x + y)\n");
        assert_eq!(output, vec!["30"]);
    }

    #[test]
    fn calls_user_functions() {
        let output = run_capture("function f(a, b) { return a * b }\nprint(f(6, 7))\n");
        assert_eq!(output, vec!["42"]);
    }

    #[test]
    fn for_loop_over_range_builds_string() {
        let output = run_capture("s = \"\"\nfor i in range(1, 4) { s = s + string(i) }\nprint(s)\n");
        assert_eq!(output, vec!["123"]);
    }

    #[test]
    fn indexes_arrays() {
        let output = run_capture("a = [1, 2, 3]\nprint(a[0] + a[2])\n");
        assert_eq!(output, vec!["4"]);
    }

    #[test]
    fn reads_object_members() {
        let output = run_capture("o = {n: \"Alice\", a: 30}\nprint(o.n)\n");
        assert_eq!(output, vec!["Alice"]);
    }

    #[test]
    fn closures_capture_parameters() {
        let output = run_capture(indoc! {"
            function mk(x) { return (y) -> x + y }
            add5 = mk(5)
            print(add5(3))
        "});
        assert_eq!(output, vec!["8"]);
    }

    #[test]
    fn classes_construct_and_dispatch() {
        let output = run_capture(indoc! {"
            class C {
                function constructor(v) { this.v = v }
                function get() { return this.v }
            }
            print(new C(7).get())
        "});
        assert_eq!(output, vec!["7"]);
    }

    #[test]
    fn closure_captures_the_local_not_its_value() {
        let output = run_capture(indoc! {"
            function mk() {
                n = 1
                f = () -> n
                n = 2
                return f
            }
            print(mk()())
        "});
        assert_eq!(output, vec!["2"]);
    }

    #[test]
    fn closures_share_a_mutable_cell() {
        let output = run_capture(indoc! {"
            function counter() {
                n = 0
                return () -> {
                    n = n + 1
                    return n
                }
            }
            c = counter()
            c()
            c()
            print(c())
        "});
        assert_eq!(output, vec!["3"]);
    }

    #[test]
    fn division_by_zero_yields_ieee_specials() {
        let output = run_capture("print(1 / 0)\nprint(-1 / 0)\nprint(0 / 0)\n");
        assert_eq!(output, vec!["inf", "-inf", "nan"]);
    }

    #[test]
    fn modulo_is_floored_like_the_divisor() {
        let output = run_capture("print(-7 % 3)\nprint(7 % -3)\nprint(7 % 3)\nprint(-7 % -3)\n");
        assert_eq!(output, vec!["2", "-2", "1", "-1"]);
    }

    #[test]
    fn nan_is_not_equal_to_itself() {
        let output = run_capture("n = 0 / 0\nprint(n == n)\nprint(n != n)\n");
        assert_eq!(output, vec!["false", "true"]);
    }

    #[test]
    fn deep_recursion_survives_a_thousand_frames() {
        let output = run_capture(indoc! {"
            function down(n) {
                if n == 0 { return 0 }
                return down(n - 1)
            }
            print(down(1200))
        "});
        assert_eq!(output, vec!["0"]);
    }

    #[test]
    fn runaway_recursion_hits_the_documented_limit() {
        let error = run_error("function f() { return f() }\nf()\n");
        assert!(matches!(error.kind, ErrorKind::StackOverflow));
        assert!(!error.trace.is_empty());
    }

    #[test]
    fn array_reads_out_of_range_yield_null() {
        let output = run_capture("a = [1]\nprint(a[5])\nprint(a[-1])\n");
        assert_eq!(output, vec!["null", "null"]);
    }

    #[test]
    fn array_writes_out_of_range_raise() {
        let error = run_error("a = [1]\na[5] = 2\n");
        assert!(matches!(error.kind, ErrorKind::Index(_)));
    }

    #[test]
    fn member_access_is_lenient_bracket_access_is_strict() {
        let output = run_capture("o = {a: 1}\nprint(o.missing)\n");
        assert_eq!(output, vec!["null"]);
        let error = run_error("o = {a: 1}\nprint(o[\"missing\"])\n");
        assert!(matches!(error.kind, ErrorKind::Key(_)));
    }

    #[test]
    fn string_plus_number_concatenates() {
        let output = run_capture("print(\"n=\" + 2)\nprint(3 + \"!\")\nprint(\"a\" + \"b\")\n");
        assert_eq!(output, vec!["n=2", "3!", "ab"]);
    }

    #[test]
    fn adding_incompatible_types_raises() {
        let error = run_error("x = [1] + 2\n");
        assert!(matches!(error.kind, ErrorKind::Type(_)));
    }

    #[test]
    fn undefined_names_raise_name_errors() {
        let error = run_error("print(nowhere)\n");
        assert!(matches!(error.kind, ErrorKind::Name(_)));
        assert_eq!(error.span.line, 1);
    }

    #[test]
    fn short_circuit_skips_the_right_operand() {
        let output = run_capture(indoc! {"
            function boom() { missing() }
            print(false and boom())
            print(true or boom())
            print(1 and 2)
            print(null or \"fallback\")
        "});
        assert_eq!(output, vec!["false", "true", "2", "fallback"]);
    }

    #[test]
    fn while_loop_with_break_and_continue() {
        let output = run_capture(indoc! {"
            i = 0
            total = 0
            while true {
                i = i + 1
                if i > 10 { break }
                if i % 2 == 0 { continue }
                total = total + i
            }
            print(total)
        "});
        assert_eq!(output, vec!["25"]);
    }

    #[test]
    fn iterates_strings_and_object_keys_in_order() {
        let output = run_capture(indoc! {"
            s = \"\"
            for c in \"abc\" { s = c + s }
            print(s)
            o = {z: 1, a: 2, m: 3}
            keys = \"\"
            for k in o { keys = keys + k }
            print(keys)
        "});
        assert_eq!(output, vec!["cba", "zam"]);
    }

    #[test]
    fn try_catch_receives_thrown_values() {
        let output = run_capture(indoc! {"
            try {
                throw \"boom\"
            } catch err {
                print(\"caught \" + err)
            }
        "});
        assert_eq!(output, vec!["caught boom"]);
    }

    #[test]
    fn runtime_errors_are_catchable_as_objects() {
        let output = run_capture(indoc! {"
            try {
                x = 1 + [2]
            } catch err {
                print(err.kind)
                print(err.line)
            }
        "});
        assert_eq!(output, vec!["TypeError", "2"]);
    }

    #[test]
    fn finally_runs_on_both_paths() {
        let output = run_capture(indoc! {"
            try {
                print(\"a\")
            } finally {
                print(\"f1\")
            }
            try {
                throw 1
            } catch e {
                print(\"b\")
            } finally {
                print(\"f2\")
            }
        "});
        assert_eq!(output, vec!["a", "f1", "b", "f2"]);
    }

    #[test]
    fn uncaught_finally_reraises_after_running() {
        let console = Console::capture();
        let code = crate::compile(indoc! {"
            try {
                throw \"up\"
            } finally {
                print(\"cleanup\")
            }
        "})
        .expect("compile should succeed");
        let mut vm = Vm::new(Registry::standard(&console));
        let error = vm.run(&code).expect_err("run should fail");
        assert_eq!(console.captured(), vec!["cleanup"]);
        assert!(matches!(error.kind, ErrorKind::Thrown(_)));
    }

    #[test]
    fn break_inside_try_runs_finally_exactly_once() {
        let output = run_capture(indoc! {"
            count = 0
            for i in range(3) {
                try {
                    if i == 1 { break }
                } finally {
                    count = count + 1
                }
            }
            print(count)
        "});
        assert_eq!(output, vec!["2"]);
    }

    #[test]
    fn continue_inside_try_runs_finally_each_iteration() {
        let output = run_capture(indoc! {"
            count = 0
            for i in range(3) {
                try {
                    continue
                } finally {
                    count = count + 1
                }
            }
            print(count)
        "});
        assert_eq!(output, vec!["3"]);
    }

    #[test]
    fn return_inside_try_runs_finally_first() {
        let output = run_capture(indoc! {"
            function f() {
                try {
                    return \"value\"
                } finally {
                    print(\"finally\")
                }
            }
            print(f())
        "});
        assert_eq!(output, vec!["finally", "value"]);
    }

    #[test]
    fn exceptions_unwind_through_call_frames() {
        let output = run_capture(indoc! {"
            function inner() { throw \"deep\" }
            function outer() { inner() }
            try {
                outer()
            } catch e {
                print(e)
            }
        "});
        assert_eq!(output, vec!["deep"]);
    }

    #[test]
    fn uncaught_errors_carry_the_call_stack() {
        let error = run_error(indoc! {"
            function inner() { throw 1 }
            function outer() { inner() }
            outer()
        "});
        let names: Vec<&str> = error
            .trace
            .iter()
            .map(|frame| frame.function.as_str())
            .collect();
        assert_eq!(names, vec!["inner", "outer", "<main>"]);
    }

    #[test]
    fn match_selects_arms_and_falls_through() {
        let output = run_capture(indoc! {"
            function pick(x) {
                match x {
                    case 1 { return \"one\" }
                    case \"two\" { return \"two!\" }
                    default { return \"other\" }
                }
            }
            print(pick(1))
            print(pick(\"two\"))
            print(pick(99))
            match 5 {
                case 1 { print(\"unreached\") }
            }
            print(\"after\")
        "});
        assert_eq!(output, vec!["one", "two!", "other", "after"]);
    }

    #[test]
    fn inheritance_walks_the_base_chain_and_super_works() {
        let output = run_capture(indoc! {"
            class Animal {
                function constructor(name) { this.name = name }
                function speak() { return this.name + \" makes a sound\" }
            }
            class Dog extends Animal {
                function speak() { return super.speak() + \": woof\" }
            }
            d = new Dog(\"Rex\")
            print(d.speak())
            print(d.name)
        "});
        assert_eq!(output, vec!["Rex makes a sound: woof", "Rex"]);
    }

    #[test]
    fn constructor_return_value_is_ignored() {
        let output = run_capture(indoc! {"
            class C {
                function constructor() {
                    this.ok = true
                    return 42
                }
            }
            c = new C()
            print(c.ok)
        "});
        assert_eq!(output, vec!["true"]);
    }

    #[test]
    fn calling_a_class_is_equivalent_to_new() {
        let output = run_capture(indoc! {"
            class P {
                function constructor(x) { this.x = x }
            }
            p = P(9)
            print(p.x)
        "});
        assert_eq!(output, vec!["9"]);
    }

    #[test]
    fn missing_arguments_fill_with_null_extras_drop() {
        let output = run_capture(indoc! {"
            function f(a, b) { return string(a) + \"/\" + string(b) }
            print(f(1))
            print(f(1, 2, 3))
        "});
        assert_eq!(output, vec!["1/null", "1/2"]);
    }

    #[test]
    fn methods_are_first_class_once_bound() {
        let output = run_capture(indoc! {"
            class Greeter {
                function constructor(who) { this.who = who }
                function hello() { return \"hi \" + this.who }
            }
            g = new Greeter(\"ada\")
            f = g.hello
            print(f())
        "});
        assert_eq!(output, vec!["hi ada"]);
    }

    #[test]
    fn compound_assignment_updates_members_and_elements() {
        let output = run_capture(indoc! {"
            o = {count: 1}
            o.count += 4
            a = [10, 20]
            a[1] *= 2
            print(o.count)
            print(a[1])
        "});
        assert_eq!(output, vec!["5", "40"]);
    }

    #[test]
    fn calling_a_non_callable_raises_type_error() {
        let error = run_error("x = 5\nx(1)\n");
        assert!(matches!(error.kind, ErrorKind::Type(_)));
    }

    #[test]
    fn unary_minus_on_largest_magnitude_number() {
        let output = run_capture("big = 1.7976931348623157e308\nprint(-big == 0 - big)\n");
        assert_eq!(output, vec!["true"]);
    }

    #[test]
    fn power_is_right_associative_at_runtime() {
        let output = run_capture("print(2 ^ 3 ^ 2)\n");
        assert_eq!(output, vec!["512"]);
    }

    #[test]
    fn evaluation_order_is_left_to_right() {
        let output = run_capture(indoc! {"
            state = {seen: \"\"}
            function see(x) {
                state.seen = state.seen + string(x)
                return x
            }
            pair = [see(1), see(2)]
            obj = {a: see(3), b: see(4)}
            total = see(5) + see(6)
            print(state.seen)
        "});
        assert_eq!(output, vec!["123456"]);
    }

    #[test]
    fn imports_resolve_through_the_host_hook() {
        let console = Console::capture();
        let code = crate::compile("import math\nprint(\"after\")\n").expect("compile");
        let mut vm = Vm::new(Registry::standard(&console));
        vm.run(&code).expect("run should succeed");
        assert_eq!(console.captured(), vec!["after"]);
    }

    #[test]
    fn globals_persist_between_runs() {
        let console = Console::capture();
        let mut vm = Vm::new(Registry::standard(&console));
        let first = crate::compile("x = 41\n").expect("compile");
        vm.run(&first).expect("run should succeed");
        let second = crate::compile("print(x + 1)\n").expect("compile");
        vm.run(&second).expect("run should succeed");
        assert_eq!(console.captured(), vec!["42"]);
    }

    #[test]
    fn host_registered_builtins_are_reachable() {
        let console = Console::capture();
        let mut registry = Registry::standard(&console);
        registry.register("double", Some(1), |args| match &args[0] {
            Value::Number(n) => Ok(Value::Number(n * 2.0)),
            other => Err(ErrorKind::Type(format!(
                "expected number, got {}",
                other.type_name()
            ))),
        });
        let mut vm = Vm::new(registry);
        let code = crate::compile("print(double(21))\n").expect("compile");
        vm.run(&code).expect("run should succeed");
        assert_eq!(console.captured(), vec!["42"]);
    }

    #[test]
    fn builtin_arity_hints_are_enforced() {
        let error = run_error("len(1, 2)\n");
        assert!(matches!(error.kind, ErrorKind::Arity(_)));
    }
}
