//! Block execution against a capability-restricted Lua environment.

use mlua::{Function, HookTriggers, Lua, LuaOptions, MultiValue, StdLib, Table, VmState};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use codebox_core::{Error, Namespace, Result, Value};

use crate::capability::{Capability, CapabilitySet};
use crate::convert::{from_lua, to_lua};
use crate::files;
use crate::port::QueryPort;

/// Error text reported for interrupted blocks.
pub const INTERRUPTED: &str = "execution interrupted";

const TRUNCATION_NOTICE: &str = "\n[output truncated]\n";

// =============================================================================
// Interrupt
// =============================================================================

/// Cooperative stop signal polled by the interpreter.
///
/// Triggered explicitly by a canceller or implicitly once the optional
/// deadline passes.
#[derive(Debug, Default)]
pub struct Interrupt {
    triggered: AtomicBool,
    deadline: Option<Instant>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            triggered: AtomicBool::new(false),
            deadline: Some(deadline),
        }
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

// =============================================================================
// Limits & Results
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Captured `print` output beyond this is dropped.
    pub max_output_bytes: usize,
    /// Interpreter heap cap. Allocation beyond it raises an in-sandbox error.
    pub max_memory_bytes: Option<usize>,
    /// VM instructions between interrupt checks.
    pub hook_interval: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_output_bytes: 64 * 1024,
            max_memory_bytes: None,
            hook_interval: 10_000,
        }
    }
}

/// Result of running one block.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub stdout: String,
    pub stderr: String,
    pub return_value: Option<Value>,
    /// In-sandbox error, if the block raised one.
    pub error: Option<String>,
    /// The block stopped because its [`Interrupt`] fired.
    pub interrupted: bool,
    /// Bindings after the block. `None` when the block did not complete,
    /// in which case the previous namespace stays authoritative.
    pub namespace: Option<Namespace>,
}

impl Execution {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && !self.interrupted
    }
}

struct OutputBuffer {
    text: String,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    fn push_line(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        if self.text.len() + line.len() + 1 <= self.limit {
            self.text.push_str(line);
            self.text.push('\n');
            return;
        }
        let mut cut = self.limit.saturating_sub(self.text.len()).min(line.len());
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        self.text.push_str(&line[..cut]);
        self.text.push_str(TRUNCATION_NOTICE);
        self.truncated = true;
    }
}

// =============================================================================
// Interpreter
// =============================================================================

/// Runs code blocks against a namespace.
///
/// Each call builds a fresh VM, installs the namespace bindings next to the
/// enabled capabilities, evaluates the block and reads the bindings back.
/// The caller's namespace is never touched, so a failed block leaves no
/// partial state behind.
#[derive(Debug, Clone, Default)]
pub struct Interpreter {
    capabilities: CapabilitySet,
    limits: Limits,
}

impl Interpreter {
    pub fn new(capabilities: CapabilitySet, limits: Limits) -> Self {
        Self {
            capabilities,
            limits,
        }
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Execute `code`.
    ///
    /// In-sandbox failures are reported inside the returned [`Execution`];
    /// `Err` means the interpreter itself could not be set up or read back.
    pub fn run(
        &self,
        code: &str,
        namespace: &Namespace,
        port: Arc<dyn QueryPort>,
        interrupt: Arc<Interrupt>,
    ) -> Result<Execution> {
        let lua = Lua::new_with(
            StdLib::MATH | StdLib::STRING | StdLib::TABLE | StdLib::UTF8,
            LuaOptions::default(),
        )
        .map_err(fault)?;
        if let Some(limit) = self.limits.max_memory_bytes {
            lua.set_memory_limit(limit).map_err(fault)?;
        }

        let reserved = self.capabilities.reserved_names();
        let stdout = Arc::new(Mutex::new(OutputBuffer::new(self.limits.max_output_bytes)));
        let env = self
            .build_env(&lua, &stdout, port, &interrupt)
            .map_err(fault)?;

        let mut stderr = String::new();
        for (name, value) in namespace.iter() {
            if reserved.contains(name.as_str()) {
                stderr.push_str(&format!("warning: binding '{}' shadows a builtin and was skipped\n", name));
                continue;
            }
            env.raw_set(name.as_str(), to_lua(&lua, value).map_err(fault)?)
                .map_err(fault)?;
        }

        // The hook stays installed after evaluation so finalizers run during
        // VM teardown are still bounded.
        let finished = Arc::new(AtomicBool::new(false));
        let hook_interrupt = Arc::clone(&interrupt);
        let hook_finished = Arc::clone(&finished);
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(self.limits.hook_interval),
            move |_lua, _debug| {
                if hook_interrupt.is_triggered() || hook_finished.load(Ordering::SeqCst) {
                    Err(mlua::Error::RuntimeError(INTERRUPTED.to_string()))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );

        let result = lua
            .load(code)
            .set_name("=block")
            .set_environment(env.clone())
            .eval::<mlua::Value>();
        finished.store(true, Ordering::SeqCst);

        let interrupted = interrupt.is_triggered();
        let stdout = take_output(&stdout);

        let value = match result {
            Ok(value) if !interrupted => value,
            Ok(_) => {
                return Ok(failed(stdout, stderr, INTERRUPTED.to_string(), INTERRUPTED, true));
            }
            Err(e) => {
                if interrupted {
                    return Ok(failed(stdout, stderr, INTERRUPTED.to_string(), INTERRUPTED, true));
                }
                let detail = e.to_string();
                return Ok(failed(stdout, stderr, format_lua_error(&e), &detail, false));
            }
        };

        let mut next = Namespace::new();
        for pair in env.pairs::<mlua::Value, mlua::Value>() {
            let (key, item) = pair.map_err(fault)?;
            let name = match key {
                mlua::Value::String(s) => String::from_utf8_lossy(&s.as_bytes()).into_owned(),
                _ => continue,
            };
            if reserved.contains(name.as_str()) {
                continue;
            }
            match item {
                mlua::Value::Function(_) => {
                    tracing::debug!(binding = %name, "Dropping function binding");
                }
                other => match from_lua(&other) {
                    Ok(v) => {
                        next.insert(name, v);
                    }
                    Err(reason) => {
                        stderr.push_str(&format!("warning: binding '{}' not kept: {}\n", name, reason));
                    }
                },
            }
        }

        let return_value = match &value {
            mlua::Value::Nil => None,
            other => Some(from_lua(other).unwrap_or_else(|_| Value::Str(format!("<{}>", other.type_name())))),
        };

        Ok(Execution {
            stdout,
            stderr,
            return_value,
            error: None,
            interrupted: false,
            namespace: Some(next),
        })
    }

    fn build_env(
        &self,
        lua: &Lua,
        stdout: &Arc<Mutex<OutputBuffer>>,
        port: Arc<dyn QueryPort>,
        interrupt: &Arc<Interrupt>,
    ) -> mlua::Result<Table> {
        let env = lua.create_table()?;
        let globals = lua.globals();

        for capability in self.capabilities.iter() {
            match capability {
                Capability::Core => install_core(lua, &env, &globals, interrupt)?,
                Capability::Math => env.set("math", globals.get::<Table>("math")?)?,
                Capability::Text => {
                    let string: Table = globals.get("string")?;
                    string.raw_set("dump", mlua::Value::Nil)?;
                    env.set("string", string)?;
                    env.set("utf8", globals.get::<Table>("utf8")?)?;
                }
                Capability::Collections => env.set("table", globals.get::<Table>("table")?)?,
                Capability::Json => env.set("json", json_table(lua)?)?,
                Capability::Output => install_print(lua, &env, &globals, Arc::clone(stdout))?,
                Capability::Files => {
                    if let Some(workdir) = self.capabilities.workdir() {
                        install_files(lua, &env, workdir.to_path_buf())?;
                    }
                }
                Capability::Query => install_query(lua, &env, Arc::clone(&port), Arc::clone(interrupt))?,
                Capability::Introspection => {
                    install_introspection(lua, &env, self.capabilities.reserved_names())?
                }
            }
        }
        Ok(env)
    }
}

fn fault(e: mlua::Error) -> Error {
    Error::execution_fault(format!("interpreter failure: {}", e))
}

fn take_output(stdout: &Arc<Mutex<OutputBuffer>>) -> String {
    let mut buf = stdout.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    std::mem::take(&mut buf.text)
}

fn failed(stdout: String, mut stderr: String, message: String, detail: &str, interrupted: bool) -> Execution {
    stderr.push_str(detail);
    stderr.push('\n');
    Execution {
        stdout,
        stderr,
        return_value: None,
        error: Some(message),
        interrupted,
        namespace: None,
    }
}

/// Render an interpreter error as the message the block raised.
pub fn format_lua_error(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(msg) => strip_traceback(msg).to_string(),
        mlua::Error::CallbackError { cause, .. } => format_lua_error(cause),
        mlua::Error::SyntaxError { message, .. } => format!("syntax error: {}", message),
        mlua::Error::MemoryError(_) => "out of memory".to_string(),
        other => other.to_string(),
    }
}

fn strip_traceback(msg: &str) -> &str {
    msg.split("\nstack traceback:").next().unwrap_or(msg)
}

fn lua_str(lua: &Lua, s: &str) -> mlua::Result<mlua::Value> {
    Ok(mlua::Value::String(lua.create_string(s)?))
}

// =============================================================================
// Capabilities
// =============================================================================

fn install_core(lua: &Lua, env: &Table, globals: &Table, interrupt: &Arc<Interrupt>) -> mlua::Result<()> {
    for name in Capability::Core.globals() {
        if *name == "pcall" {
            continue;
        }
        env.set(*name, globals.get::<mlua::Value>(*name)?)?;
    }

    // pcall must not swallow an interrupt.
    let interrupt = Arc::clone(interrupt);
    let pcall = lua.create_function(move |lua, (func, args): (Function, MultiValue)| {
        match func.call::<MultiValue>(args) {
            Ok(values) => {
                let mut out = vec![mlua::Value::Boolean(true)];
                out.extend(values);
                Ok(MultiValue::from_vec(out))
            }
            Err(e) if interrupt.is_triggered() => Err(e),
            Err(e) => Ok(MultiValue::from_vec(vec![
                mlua::Value::Boolean(false),
                lua_str(lua, &format_lua_error(&e))?,
            ])),
        }
    })?;
    env.set("pcall", pcall)
}

fn install_print(lua: &Lua, env: &Table, globals: &Table, stdout: Arc<Mutex<OutputBuffer>>) -> mlua::Result<()> {
    let tostring: Function = globals.get("tostring")?;
    let print = lua.create_function(move |_, args: MultiValue| {
        let mut parts = Vec::with_capacity(args.len());
        for arg in args {
            parts.push(tostring.call::<String>(arg)?);
        }
        stdout
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_line(&parts.join("\t"));
        Ok(())
    })?;
    env.set("print", print)
}

fn json_table(lua: &Lua) -> mlua::Result<Table> {
    let json = lua.create_table()?;
    json.set(
        "encode",
        lua.create_function(|_, value: mlua::Value| {
            let value = from_lua(&value).map_err(mlua::Error::RuntimeError)?;
            serde_json::to_string(&value.to_json()).map_err(|e| mlua::Error::RuntimeError(e.to_string()))
        })?,
    )?;
    json.set(
        "decode",
        lua.create_function(|lua, text: String| {
            let parsed: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| mlua::Error::RuntimeError(format!("invalid json: {}", e)))?;
            to_lua(lua, &Value::from_json(&parsed))
        })?,
    )?;
    Ok(json)
}

fn install_files(lua: &Lua, env: &Table, workdir: PathBuf) -> mlua::Result<()> {
    let root = workdir.clone();
    env.set(
        "read_file",
        lua.create_function(move |lua, path: String| match files::read(&root, &path) {
            Ok(content) => Ok((lua_str(lua, &content)?, mlua::Value::Nil)),
            Err(reason) => Ok((mlua::Value::Nil, lua_str(lua, &reason)?)),
        })?,
    )?;

    let root = workdir.clone();
    env.set(
        "write_file",
        lua.create_function(move |lua, (path, content): (String, String)| {
            match files::write(&root, &path, &content) {
                Ok(()) => Ok((mlua::Value::Boolean(true), mlua::Value::Nil)),
                Err(reason) => Ok((mlua::Value::Nil, lua_str(lua, &reason)?)),
            }
        })?,
    )?;

    env.set(
        "list_files",
        lua.create_function(move |lua, ()| match files::list(&workdir) {
            Ok(names) => Ok((mlua::Value::Table(lua.create_sequence_from(names)?), mlua::Value::Nil)),
            Err(reason) => Ok((mlua::Value::Nil, lua_str(lua, &reason)?)),
        })?,
    )
}

fn install_query(lua: &Lua, env: &Table, port: Arc<dyn QueryPort>, interrupt: Arc<Interrupt>) -> mlua::Result<()> {
    let single_port = Arc::clone(&port);
    let single_interrupt = Arc::clone(&interrupt);
    env.set(
        "llm_query",
        lua.create_function(move |lua, prompt: String| {
            if single_interrupt.is_triggered() {
                return Err(mlua::Error::RuntimeError(INTERRUPTED.to_string()));
            }
            match single_port.query(&prompt) {
                Ok(text) => Ok((lua_str(lua, &text)?, mlua::Value::Nil)),
                Err(reason) => Ok((mlua::Value::Nil, lua_str(lua, &reason)?)),
            }
        })?,
    )?;

    env.set(
        "llm_query_batched",
        lua.create_function(move |lua, prompts: Vec<String>| {
            if interrupt.is_triggered() {
                return Err(mlua::Error::RuntimeError(INTERRUPTED.to_string()));
            }
            let results = lua.create_table()?;
            let errors = lua.create_table()?;
            for (i, outcome) in port.query_batched(&prompts).into_iter().enumerate() {
                match outcome {
                    Ok(text) => results.raw_set(i + 1, text)?,
                    Err(reason) => {
                        results.raw_set(i + 1, false)?;
                        errors.raw_set(i + 1, reason)?;
                    }
                }
            }
            Ok((results, errors))
        })?,
    )
}

fn install_introspection(lua: &Lua, env: &Table, reserved: BTreeSet<&'static str>) -> mlua::Result<()> {
    let scope = env.clone();
    let hidden = reserved.clone();
    env.set(
        "show_vars",
        lua.create_function(move |_, ()| list_user_vars(&scope, &hidden))?,
    )?;

    let scope = env.clone();
    env.set(
        "final_var",
        lua.create_function(move |_, name: mlua::Value| {
            let name = match name {
                mlua::Value::String(s) => String::from_utf8_lossy(&s.as_bytes()).into_owned(),
                other => {
                    return Ok(format!(
                        "Error: final_var expects a variable name, got {}",
                        other.type_name()
                    ))
                }
            };
            let name = name.trim().trim_matches(|c| c == '"' || c == '\'');
            match scope.raw_get::<mlua::Value>(name)? {
                mlua::Value::Nil => Ok(format!(
                    "Error: Variable '{}' not found. {}",
                    name,
                    list_user_vars(&scope, &reserved)?
                )),
                value => Ok(match from_lua(&value) {
                    Ok(v) => v.to_string(),
                    Err(_) => format!("<{}>", value.type_name()),
                }),
            }
        })?,
    )
}

fn list_user_vars(env: &Table, reserved: &BTreeSet<&'static str>) -> mlua::Result<String> {
    let mut vars = Vec::new();
    for pair in env.clone().pairs::<mlua::Value, mlua::Value>() {
        let (key, value) = pair?;
        if let mlua::Value::String(s) = key {
            let name = String::from_utf8_lossy(&s.as_bytes()).into_owned();
            if !reserved.contains(name.as_str()) {
                vars.push(format!("{} ({})", name, value.type_name()));
            }
        }
    }
    if vars.is_empty() {
        return Ok("No variables defined.".to_string());
    }
    vars.sort();
    Ok(format!("Available variables: {}", vars.join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::NullPort;
    use std::time::Duration;

    struct ScriptedPort;

    impl QueryPort for ScriptedPort {
        fn query(&self, prompt: &str) -> std::result::Result<String, String> {
            if prompt == "fail" {
                Err("model unavailable".to_string())
            } else {
                Ok(format!("answer to {}", prompt))
            }
        }

        fn query_batched(&self, prompts: &[String]) -> Vec<std::result::Result<String, String>> {
            prompts.iter().map(|p| self.query(p)).collect()
        }
    }

    fn run(code: &str, ns: &Namespace) -> Execution {
        Interpreter::default()
            .run(code, ns, Arc::new(ScriptedPort), Arc::new(Interrupt::new()))
            .unwrap()
    }

    #[test]
    fn test_bindings_persist_and_return_value() {
        let mut ns = Namespace::new();
        ns.insert("x", Value::Int(1));

        let exec = run("x = x + 1\ny = 'hi'\nreturn x * 10", &ns);
        assert!(exec.succeeded());
        assert_eq!(exec.return_value, Some(Value::Int(20)));
        let next = exec.namespace.unwrap();
        assert_eq!(next.get("x"), Some(&Value::Int(2)));
        assert_eq!(next.get("y"), Some(&Value::Str("hi".into())));
        assert!(!next.contains("print"));
    }

    #[test]
    fn test_print_captured() {
        let exec = run("print('a', 1, true)\nprint(2.5)", &Namespace::new());
        assert_eq!(exec.stdout, "a\t1\ttrue\n2.5\n");
    }

    #[test]
    fn test_error_keeps_no_partial_state() {
        let mut ns = Namespace::new();
        ns.insert("x", Value::Int(1));
        let exec = run("x = 99\nerror('boom')", &ns);
        assert!(!exec.succeeded());
        assert!(exec.error.unwrap().contains("boom"));
        assert!(exec.namespace.is_none());
        assert!(exec.stderr.contains("boom"));
    }

    #[test]
    fn test_syntax_error() {
        let exec = run("x = = 1", &Namespace::new());
        assert!(exec.error.unwrap().starts_with("syntax error"));
    }

    #[test]
    fn test_disallowed_operations_absent() {
        for code in [
            "return load('return 1')",
            "return require('os')",
            "return os.time()",
            "return io.open('/etc/passwd')",
            "return debug.getinfo(1)",
            "return string.dump(print)",
            "return dofile('/etc/passwd')",
            "return getmetatable('').__index",
        ] {
            let exec = run(code, &Namespace::new());
            assert!(exec.error.is_some(), "expected '{}' to fail", code);
        }
    }

    #[test]
    fn test_json_roundtrip() {
        let exec = run(
            "local t = json.decode('{\"a\":[1,2],\"b\":null}')\nreturn json.encode(t.a)",
            &Namespace::new(),
        );
        assert_eq!(exec.return_value, Some(Value::Str("[1,2]".into())));
    }

    #[test]
    fn test_queries() {
        let exec = run(
            "local a = llm_query('ping')\nlocal b, err = llm_query('fail')\nreturn {a, b == nil, err}",
            &Namespace::new(),
        );
        assert_eq!(
            exec.return_value,
            Some(Value::List(vec![
                Value::Str("answer to ping".into()),
                Value::Bool(true),
                Value::Str("model unavailable".into()),
            ]))
        );
    }

    #[test]
    fn test_batched_queries_keep_order() {
        let exec = run(
            "local r, errs = llm_query_batched({'a', 'fail', 'c'})\nreturn {r[1], r[2], r[3], errs[2]}",
            &Namespace::new(),
        );
        assert_eq!(
            exec.return_value,
            Some(Value::List(vec![
                Value::Str("answer to a".into()),
                Value::Bool(false),
                Value::Str("answer to c".into()),
                Value::Str("model unavailable".into()),
            ]))
        );
    }

    #[test]
    fn test_queries_without_bridge() {
        let exec = Interpreter::default()
            .run(
                "local r, err = llm_query('x')\nreturn err",
                &Namespace::new(),
                Arc::new(NullPort),
                Arc::new(Interrupt::new()),
            )
            .unwrap();
        assert!(matches!(exec.return_value, Some(Value::Str(_))));
    }

    #[test]
    fn test_deadline_interrupts_loop() {
        let interrupt = Arc::new(Interrupt::with_deadline(Instant::now() + Duration::from_millis(100)));
        let exec = Interpreter::default()
            .run("while true do end", &Namespace::new(), Arc::new(NullPort), interrupt)
            .unwrap();
        assert!(exec.interrupted);
        assert_eq!(exec.error.as_deref(), Some(INTERRUPTED));
        assert!(exec.namespace.is_none());
    }

    #[test]
    fn test_pcall_cannot_swallow_interrupt() {
        let interrupt = Arc::new(Interrupt::with_deadline(Instant::now() + Duration::from_millis(100)));
        let exec = Interpreter::default()
            .run(
                "while true do pcall(function() while true do end end) end",
                &Namespace::new(),
                Arc::new(NullPort),
                interrupt,
            )
            .unwrap();
        assert!(exec.interrupted);
    }

    #[test]
    fn test_pcall_catches_ordinary_errors() {
        let exec = run("local ok, err = pcall(error, 'bad')\nreturn {ok, err}", &Namespace::new());
        assert_eq!(
            exec.return_value,
            Some(Value::List(vec![Value::Bool(false), Value::Str("bad".into())]))
        );
    }

    #[test]
    fn test_output_truncated() {
        let interpreter = Interpreter::new(
            CapabilitySet::standard(),
            Limits {
                max_output_bytes: 16,
                ..Limits::default()
            },
        );
        let exec = interpreter
            .run(
                "for i = 1, 100 do print('line ' .. i) end",
                &Namespace::new(),
                Arc::new(NullPort),
                Arc::new(Interrupt::new()),
            )
            .unwrap();
        assert!(exec.stdout.ends_with(TRUNCATION_NOTICE));
        assert!(exec.stdout.len() <= 16 + TRUNCATION_NOTICE.len());
    }

    #[test]
    fn test_memory_limit() {
        let interpreter = Interpreter::new(
            CapabilitySet::standard(),
            Limits {
                max_memory_bytes: Some(4 * 1024 * 1024),
                ..Limits::default()
            },
        );
        let exec = interpreter
            .run(
                "local t = {}\nfor i = 1, 10000000 do t[i] = string.rep('x', 64) .. i end",
                &Namespace::new(),
                Arc::new(NullPort),
                Arc::new(Interrupt::new()),
            )
            .unwrap();
        assert!(exec.error.is_some());
        assert!(!exec.interrupted);
    }

    #[test]
    fn test_files_confined() {
        let dir = tempfile::tempdir().unwrap();
        let interpreter = Interpreter::new(CapabilitySet::standard().with_files(dir.path()), Limits::default());
        let exec = interpreter
            .run(
                "assert(write_file('out/a.txt', 'data'))\nlocal ok, err = read_file('../secret')\nreturn {read_file('out/a.txt'), ok == nil, list_files()[1]}",
                &Namespace::new(),
                Arc::new(NullPort),
                Arc::new(Interrupt::new()),
            )
            .unwrap();
        assert_eq!(
            exec.return_value,
            Some(Value::List(vec![
                Value::Str("data".into()),
                Value::Bool(true),
                Value::Str("out".into()),
            ]))
        );
    }

    #[test]
    fn test_files_absent_by_default() {
        let exec = run("return read_file('x')", &Namespace::new());
        assert!(exec.error.is_some());
    }

    #[test]
    fn test_show_vars_and_final_var() {
        let mut ns = Namespace::new();
        ns.insert("answer", Value::Int(42));
        let exec = run("return {show_vars(), final_var('answer'), final_var('missing')}", &ns);
        let Some(Value::List(items)) = exec.return_value else {
            panic!("expected a list");
        };
        assert_eq!(items[0], Value::Str("Available variables: answer (integer)".into()));
        assert_eq!(items[1], Value::Str("42".into()));
        assert!(items[2].as_str().unwrap().starts_with("Error: Variable 'missing' not found"));
    }

    #[test]
    fn test_keyed_tables_survive_snapshot() {
        let exec = run(
            "t = {10, 20, n = 2}\ns = {}\ns[2] = 'b'\ns[5] = 'e'",
            &Namespace::new(),
        );
        assert!(exec.succeeded(), "{:?}", exec.error);
        let stored = Namespace::decode(&exec.namespace.unwrap().encode().unwrap()).unwrap();

        let exec = run("return {t[1], t[2], t.n, #t, s[2], s[5], s[3] == nil}", &stored);
        assert_eq!(
            exec.return_value,
            Some(Value::List(vec![
                Value::Int(10),
                Value::Int(20),
                Value::Int(2),
                Value::Int(2),
                Value::Str("b".into()),
                Value::Str("e".into()),
                Value::Bool(true),
            ]))
        );
    }

    #[test]
    fn test_function_bindings_dropped() {
        let exec = run("function helper() return 1 end\nkept = helper()", &Namespace::new());
        let next = exec.namespace.unwrap();
        assert!(!next.contains("helper"));
        assert_eq!(next.get("kept"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_restricted_capability_set() {
        let interpreter = Interpreter::new(CapabilitySet::none().with(Capability::Math), Limits::default());
        let exec = interpreter
            .run(
                "return math.max(1, 2)",
                &Namespace::new(),
                Arc::new(NullPort),
                Arc::new(Interrupt::new()),
            )
            .unwrap();
        assert_eq!(exec.return_value, Some(Value::Int(2)));

        let exec = interpreter
            .run("print('x')", &Namespace::new(), Arc::new(NullPort), Arc::new(Interrupt::new()))
            .unwrap();
        assert!(exec.error.is_some());
    }
}
