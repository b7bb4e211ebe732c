//! Structured JSON logging shared by the live runner and replay.
//!
//! One line per event with a `module` field for filtering. Log lines carry
//! the same shape in live and replay runs so they diff cleanly.

use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("debug") => Level::Debug,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

static MIN_LEVEL: OnceLock<Level> = OnceLock::new();

fn min_level() -> Level {
    *MIN_LEVEL.get_or_init(Level::from_env)
}

pub fn ts_now() -> String {
    Utc::now().to_rfc3339()
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    serde_json::json!(n)
}

pub fn v_int(n: i64) -> Value {
    serde_json::json!(n)
}

pub fn v_bool(b: bool) -> Value {
    Value::Bool(b)
}

pub fn json_log(module: &str, fields: Map<String, Value>) {
    log_at(Level::Info, module, fields);
}

pub fn log_at(level: Level, module: &str, fields: Map<String, Value>) {
    if level < min_level() {
        return;
    }
    let mut map = Map::new();
    map.insert("ts".to_string(), Value::String(ts_now()));
    map.insert("level".to_string(), Value::String(level.as_str().to_string()));
    map.insert("module".to_string(), Value::String(module.to_string()));
    for (k, v) in fields {
        map.insert(k, v);
    }
    println!("{}", Value::Object(map));
}
