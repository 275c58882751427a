//! Apply and restore process environment variables.
//!
//! The process environment is global. A [`ScopedEnv`] records what it
//! replaced and puts it back on [`ScopedEnv::restore`] or drop; nested scopes
//! must be restored in reverse order of creation.
use std::collections::BTreeMap;
use std::ffi::OsString;

/// Previous values captured when a scope was applied.
#[derive(Debug)]
pub struct ScopedEnv {
    previous: Vec<(String, Option<OsString>)>,
    restored: bool,
}

impl ScopedEnv {
    /// Set every `key=value` in `vars`, remembering prior values.
    pub fn apply(vars: &BTreeMap<String, String>) -> Self {
        let mut previous = Vec::with_capacity(vars.len());
        for (key, value) in vars {
            if key.is_empty() || key.contains('=') {
                tracing::warn!(key = key.as_str(), "skipping invalid environment key");
                continue;
            }
            previous.push((key.clone(), std::env::var_os(key)));
            std::env::set_var(key, value);
        }
        Self {
            previous,
            restored: false,
        }
    }

    /// Put back the values captured by [`ScopedEnv::apply`]. Idempotent.
    pub fn restore(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;
        for (key, value) in self.previous.iter().rev() {
            match value {
                Some(value) => std::env::set_var(key, value),
                None => std::env::remove_var(key),
            }
        }
    }
}

impl Drop for ScopedEnv {
    fn drop(&mut self) {
        self.restore();
    }
}
