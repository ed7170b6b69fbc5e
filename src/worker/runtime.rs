use std::sync::mpsc as std_mpsc;

use rhai::serde::{from_dynamic, to_dynamic};
use rhai::{AST, Dynamic, Engine, Scope};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use super::natives;
use super::protocol::{WorkerAction, WorkerReply, WorkerRequest};
use crate::script::is_identifier;

/// A `rhai` engine whose global variables and function definitions survive from one
/// script to the next.
pub struct Interpreter {
    engine: Engine,
    scope: Scope<'static>,
    functions: AST,
}

impl Interpreter {
    /// A limit of 0 leaves that dimension unbounded.
    pub fn new(max_operations: u64, max_expr_depth: usize) -> Self {
        let mut engine = Engine::new();
        if max_operations > 0 {
            engine.set_max_operations(max_operations);
        }
        engine.set_max_expr_depths(max_expr_depth, max_expr_depth);
        engine.on_print(|text| debug!(target: "interpreter", "{text}"));
        engine.on_debug(|text, source, pos| {
            trace!(target: "interpreter", source = source.unwrap_or(""), %pos, "{text}")
        });
        natives::register(&mut engine);
        Self {
            engine,
            scope: Scope::new(),
            functions: AST::empty(),
        }
    }

    /// Run `script` against the shared namespace and return its last expression.
    pub fn eval(&mut self, script: &str) -> Result<Value, String> {
        let ast = self.engine.compile(script).map_err(|e| e.to_string())?;
        // functions defined by earlier scripts stay callable
        self.functions.combine(ast.clone_functions_only());
        let program = self.functions.merge(&ast);
        let result: Dynamic = self
            .engine
            .eval_ast_with_scope(&mut self.scope, &program)
            .map_err(|e| e.to_string())?;
        from_dynamic::<Value>(&result).map_err(|e| e.to_string())
    }

    /// Bind each entry as a global variable, converting JSON into native values.
    pub fn set_context(&mut self, context: Map<String, Value>) -> Result<(), String> {
        for (name, value) in context {
            if !is_identifier(&name) {
                return Err(format!("`{name}` is not a valid identifier"));
            }
            let value = to_dynamic(&value).map_err(|e| e.to_string())?;
            self.scope.set_or_push(name, value);
        }
        Ok(())
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        let value = self.scope.get(name)?;
        from_dynamic::<Value>(value).ok()
    }

    pub fn handle(&mut self, request: WorkerRequest) -> WorkerReply {
        let outcome = match request.action {
            WorkerAction::ProcessDispatch { script } => self.eval(&script),
            WorkerAction::ContextSet { context } => self.set_context(context).map(|()| Value::Null),
        };
        WorkerReply::new(request.id, outcome)
    }
}

/// Thread body: serve requests one at a time until either side hangs up.
pub(super) fn serve(
    requests: std_mpsc::Receiver<WorkerRequest>,
    replies: mpsc::UnboundedSender<WorkerReply>,
    max_operations: u64,
    max_expr_depth: usize,
) {
    let mut interpreter = Interpreter::new(max_operations, max_expr_depth);
    info!("interpreter worker started");
    while let Ok(request) = requests.recv() {
        trace!(id = request.id, action = request.action.name(), "worker request");
        let reply = interpreter.handle(request);
        if replies.send(reply).is_err() {
            break;
        }
    }
    info!("interpreter worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{BOOTSTRAP_SCRIPTS, OUTPUT_SCRIPT, PREPROCESS_SCRIPT, builtin_catalogue};
    use crate::worker::DEFAULT_MAX_EXPR_DEPTH;
    use serde_json::json;

    #[test]
    fn globals_persist_between_scripts() {
        let mut interp = Interpreter::new(0, 0);
        interp.eval("let X = 40;").unwrap();
        assert_eq!(interp.eval("X + 2").unwrap(), json!(42));
        assert_eq!(interp.global("X"), Some(json!(40)));
    }

    #[test]
    fn functions_persist_between_scripts() {
        let mut interp = Interpreter::new(0, 0);
        interp.eval("fn double(x) { x * 2 }").unwrap();
        assert_eq!(interp.eval("double(21)").unwrap(), json!(42));
    }

    #[test]
    fn context_is_visible_as_native_values() {
        let mut interp = Interpreter::new(0, 0);
        let context = Map::from_iter([("frames".to_string(), json!({"a": {"A": {"r1": 1}}}))]);
        interp.set_context(context).unwrap();
        assert_eq!(interp.eval("frames.a.A.r1 + 1").unwrap(), json!(2));
        assert_eq!(interp.eval("type_of(frames)").unwrap(), json!("map"));
    }

    #[test]
    fn errors_carry_the_interpreter_text() {
        let mut interp = Interpreter::new(0, 0);
        let err = interp.eval("throw \"broken frame\";").unwrap_err();
        assert!(err.contains("broken frame"), "{err}");
        // the namespace survives a failed script
        interp.eval("let Y = 1;").unwrap();
        assert_eq!(interp.eval("Y").unwrap(), json!(1));
    }

    #[test]
    fn operation_budget_stops_runaway_scripts() {
        let mut interp = Interpreter::new(1_000, 0);
        assert!(interp.eval("loop {}").is_err());
    }

    #[test]
    fn builtin_bootstrap_scripts_compile_and_run() {
        let catalogue = builtin_catalogue();
        let mut interp = Interpreter::new(50_000_000, DEFAULT_MAX_EXPR_DEPTH);
        for name in BOOTSTRAP_SCRIPTS.iter().chain([&PREPROCESS_SCRIPT, &OUTPUT_SCRIPT]) {
            if *name == PREPROCESS_SCRIPT {
                let context = Map::from_iter([
                    ("dfs".to_string(), json!({"a": {"A": {"r1": 1}}})),
                    ("dfs_meta".to_string(), json!({"a": {"kind": "x"}})),
                ]);
                interp.set_context(context).unwrap();
            }
            if let Err(e) = interp.eval(&catalogue[*name]) {
                panic!("`{name}` failed: {e}");
            }
        }
    }

    #[test]
    fn deep_expressions_follow_the_configured_limit() {
        let nested = format!("{}1{}", "(".repeat(40), ")".repeat(40));
        assert!(Interpreter::new(0, 16).eval(&nested).is_err());
        assert_eq!(Interpreter::new(0, DEFAULT_MAX_EXPR_DEPTH).eval(&nested).unwrap(), json!(1));
    }

    #[test]
    fn invalid_context_names_are_rejected() {
        let mut interp = Interpreter::new(0, 0);
        let context = Map::from_iter([("not valid".to_string(), json!(1))]);
        assert!(interp.set_context(context).is_err());
    }
}
