// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Startup arguments handed to a worker through its work directory.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const APP_ROOT: &str = "app_root";
pub const APP_ENV: &str = "app_env";
pub const SPAWN_METHOD: &str = "spawn_method";
pub const CONNECT_PASSWORD: &str = "connect_password";
pub const KEEPALIVE: &str = "keepalive";
pub const PROTOCOL: &str = "protocol";
pub const THREADS: &str = "threads";
pub const LISTEN: &str = "listen";
pub const SOCKET_DIR: &str = "socket_dir";

/// Value of `spawn_method` that asks a loader to act as a preloader
pub const SPAWN_METHOD_SMART: &str = "smart";

/// The arguments document, a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StartupArgs(Map<String, Value>);

impl StartupArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Read a flag given as a JSON boolean or as `"true"`/`"false"`
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Read a number given as a JSON integer or a numeric string
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn app_root(&self) -> Option<&str> {
        self.get_str(APP_ROOT)
    }

    pub fn is_smart(&self) -> bool {
        self.get_str(SPAWN_METHOD) == Some(SPAWN_METHOD_SMART)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for StartupArgs {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
