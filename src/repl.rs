//! Interactive session over a persistent VM.
//!
//! Each line compiles on its own: a line that is a single expression
//! evaluates and prints its non-null result (also bound to `_`), anything
//! else runs as statements. Globals survive between lines; errors print and
//! the session continues.

use std::io::{self, BufRead, Write};

use crate::ast::{Expr, ExprKind, Program, Stmt, StmtKind};
use crate::builtins::{Console, Registry};
use crate::emitter;
use crate::parser;
use crate::value::Value;
use crate::vm::Vm;

pub struct Repl {
    vm: Vm,
}

/// One evaluated line: the expression value to echo, or nothing for
/// statements and null results.
pub enum LineResult {
    Value(Value),
    Unit,
}

impl Repl {
    pub fn new(console: &Console) -> Self {
        Self {
            vm: Vm::new(Registry::standard(console)),
        }
    }

    pub fn eval_line(&mut self, line: &str) -> anyhow::Result<LineResult> {
        let program = parser::parse_source(line)?;

        // A lone expression line evaluates for its value: rewrite it into a
        // top-level return so the result survives the run.
        if let [
            Stmt {
                kind: StmtKind::Expr(expr),
                span,
            },
        ] = &program.statements[..]
            && !matches!(expr.kind, ExprKind::Assign { .. })
        {
            let wrapped = Program {
                statements: vec![Stmt::new(
                    StmtKind::Return(Some(Expr::new(expr.kind.clone(), expr.span))),
                    *span,
                )],
            };
            let code = emitter::compile(&wrapped)?;
            let value = self.vm.run(&code).map_err(|error| anyhow::anyhow!(error.render()))?;
            return Ok(match value {
                Value::Null => LineResult::Unit,
                value => {
                    self.vm.define_global("_", value.clone());
                    LineResult::Value(value)
                }
            });
        }

        let code = emitter::compile(&program)?;
        self.vm
            .run(&code)
            .map_err(|error| anyhow::anyhow!(error.render()))?;
        Ok(LineResult::Unit)
    }
}

/// Blocking interactive loop on stdin/stdout. `exit` or EOF ends it.
pub fn run(console: &Console) -> anyhow::Result<()> {
    let mut repl = Repl::new(console);
    println!("Mythos {} interactive shell", env!("CARGO_PKG_VERSION"));
    println!("Type 'exit' to leave.");

    let stdin = io::stdin();
    loop {
        print!("mythos> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" {
            break;
        }

        match repl.eval_line(line) {
            Ok(LineResult::Value(value)) => println!("{value}"),
            Ok(LineResult::Unit) => {}
            Err(error) => eprintln!("error: {error}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repl() -> (Console, Repl) {
        let console = Console::capture();
        let repl = Repl::new(&console);
        (console, repl)
    }

    #[test]
    fn expression_lines_yield_their_value() {
        let (_, mut repl) = repl();
        match repl.eval_line("1 + 2").expect("eval should succeed") {
            LineResult::Value(value) => assert_eq!(value.to_string(), "3"),
            LineResult::Unit => panic!("expected a value"),
        }
    }

    #[test]
    fn globals_persist_across_lines_and_bind_underscore() {
        let (_, mut repl) = repl();
        repl.eval_line("x = 20").expect("assignment should succeed");
        match repl.eval_line("x * 2").expect("eval should succeed") {
            LineResult::Value(value) => assert_eq!(value.to_string(), "40"),
            LineResult::Unit => panic!("expected a value"),
        }
        match repl.eval_line("_ + 2").expect("eval should succeed") {
            LineResult::Value(value) => assert_eq!(value.to_string(), "42"),
            LineResult::Unit => panic!("expected a value"),
        }
    }

    #[test]
    fn statement_lines_print_nothing() {
        let (console, mut repl) = repl();
        let result = repl
            .eval_line("function f(x) { return x + 1 }")
            .expect("definition should succeed");
        assert!(matches!(result, LineResult::Unit));
        match repl.eval_line("f(41)").expect("call should succeed") {
            LineResult::Value(value) => assert_eq!(value.to_string(), "42"),
            LineResult::Unit => panic!("expected a value"),
        }
        assert!(console.captured().is_empty());
    }

    #[test]
    fn errors_keep_the_session_alive() {
        let (_, mut repl) = repl();
        assert!(repl.eval_line("nonsense(").is_err());
        assert!(repl.eval_line("missing_name").is_err());
        match repl.eval_line("2 + 2").expect("eval should succeed") {
            LineResult::Value(value) => assert_eq!(value.to_string(), "4"),
            LineResult::Unit => panic!("expected a value"),
        }
    }
}
