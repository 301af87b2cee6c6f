// Copyright (c) 2024 Daniel Bergløv
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

/**
 * Environment reconstruction.
 *
 * By default the target environment is rebuilt from a whitelist: names
 * on the keep list survive, names on the check list survive if their
 * value is free of `%` and `/`, everything else is dropped. When the
 * reset policy is off the environment is passed through minus the
 * delete list and failed checks. Either way a handful of variables are
 * forced afterwards so the executed command sees a consistent identity.
 *
 * Environment files layer on top (the restricted one first, under
 * whitelist rules), login shells pull in the system environment file
 * and login-class variables, and user-supplied `VAR=value` additions
 * are applied last, after the caller has verified the user may set
 * them at all.
 */

use std::fs;

use tracing::warn;

use crate::modules::defaults::Defaults;
use crate::modules::error::ResourceError;
use crate::modules::shared::{ModeFlags, PATH_STOCK};
use crate::modules::user::User;

/**
 * An ordered `KEY=value` vector, the shape the front-end boundary and
 * the final exec expect.
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: Vec<String>,
}

impl Environment {
    pub fn from_envp(envp: &[String]) -> Environment {
        Environment {
            vars: envp.to_vec(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.iter().find_map(|entry| {
            entry
                .strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }

    pub fn set(&mut self, key: &str, value: &str) {
        let entry = format!("{key}={value}");
        for slot in &mut self.vars {
            if var_name(slot) == key {
                *slot = entry;
                return;
            }
        }
        self.vars.push(entry);
    }

    /**
     * Insert without clobbering an existing value.
     */
    pub fn set_default(&mut self, key: &str, value: &str) {
        if self.get(key).is_none() {
            self.vars.push(format!("{key}={value}"));
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.vars.retain(|entry| var_name(entry) != key);
    }

    pub fn as_slice(&self) -> &[String] {
        &self.vars
    }

    pub fn into_vec(self) -> Vec<String> {
        self.vars
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

fn var_name(entry: &str) -> &str {
    entry.split_once('=').map(|(k, _)| k).unwrap_or(entry)
}

/**
 * Login-class capability interface. Platforms without login classes
 * plug in `NullLoginClass`.
 */
pub trait LoginClassDb {
    fn valid(&self, class: &str) -> bool;
    fn env_for(&self, class: &str, user: &User) -> Vec<(String, String)>;
}

pub struct NullLoginClass;

impl LoginClassDb for NullLoginClass {
    fn valid(&self, _class: &str) -> bool {
        false
    }

    fn env_for(&self, _class: &str, _user: &User) -> Vec<(String, String)> {
        Vec::new()
    }
}

/* List entries may end in '*' for a prefix wildcard, e.g. LD_*. */
fn pattern_matches(name: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => name == pattern,
    }
}

fn in_list(name: &str, list: &[String]) -> bool {
    list.iter().any(|pattern| pattern_matches(name, pattern))
}

fn value_is_sane(value: &str) -> bool {
    !value.contains('%') && !value.contains('/')
}

/**
 * Whitelist decision for reset mode.
 */
fn keep_in_reset(def: &Defaults, name: &str, value: &str) -> bool {
    if in_list(name, &def.env_keep) {
        return true;
    }
    if in_list(name, &def.env_check) {
        return value_is_sane(value);
    }
    false
}

/**
 * Blacklist decision for pass-through mode.
 */
fn drop_in_passthrough(def: &Defaults, name: &str, value: &str) -> bool {
    if in_list(name, &def.env_delete) {
        return true;
    }
    if in_list(name, &def.env_check) {
        return !value_is_sane(value);
    }
    false
}

/**
 * Facts about the request the rebuild needs.
 */
pub struct EnvParams<'a> {
    pub user: &'a User,
    pub runas: &'a User,
    pub mode: ModeFlags,
    pub command: &'a str,
    pub ccname: Option<&'a str>,
    pub secure_path: Option<&'a str>,
}

/**
 * Produce the target environment from the invoking one.
 */
pub fn rebuild_env(current: &Environment, def: &Defaults, p: &EnvParams<'_>) -> Environment {
    let mut out = Environment::default();

    for entry in current.as_slice() {
        let (name, value) = match entry.split_once('=') {
            Some(pair) => pair,
            None => continue,
        };

        let keep = if def.env_reset {
            keep_in_reset(def, name, value)
        } else {
            !drop_in_passthrough(def, name, value)
        };
        if keep {
            out.vars.push(entry.clone());
        }
    }

    // Identity variables are forced regardless of the reset policy.
    out.set("SUDO_COMMAND", p.command);
    out.set("SUDO_USER", &p.user.name);
    out.set("SUDO_UID", &p.user.uid.as_raw().to_string());
    out.set("SUDO_GID", &p.user.gid.as_raw().to_string());

    if def.set_logname {
        out.set("USER", &p.runas.name);
        out.set("LOGNAME", &p.runas.name);
    }

    out.set("SHELL", &p.runas.shell);

    let login = p.mode.contains(ModeFlags::LOGIN_SHELL);
    if login || p.mode.contains(ModeFlags::SET_HOME) || def.set_home || def.always_set_home {
        out.set("HOME", &p.runas.home);
    } else {
        out.set_default("HOME", &p.runas.home);
    }

    if let Some(ccname) = p.ccname {
        out.set("KRB5CCNAME", ccname);
    }

    match p.secure_path {
        Some(path) => out.set("PATH", path),
        None => out.set_default("PATH", PATH_STOCK),
    }

    out
}

/**
 * Merge a `KEY=value` environment file. With `overwrite` off, existing
 * values win; with `restricted` on, only whitelist-approved variables
 * apply. A missing or unreadable file is the caller's problem to log.
 */
pub fn read_env_file(
    path: &str,
    overwrite: bool,
    restricted: bool,
    def: &Defaults,
    env: &mut Environment,
) -> Result<(), ResourceError> {
    let text = fs::read_to_string(path).map_err(|err| ResourceError::Io {
        path: path.to_string(),
        err,
    })?;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();

        let Some((name, raw)) = line.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            continue;
        }

        let value = raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'');

        if restricted && !keep_in_reset(def, name, value) {
            warn!(variable = name, file = path, "ignoring restricted environment entry");
            continue;
        }

        if overwrite {
            env.set(name, value);
        } else {
            env.set_default(name, value);
        }
    }

    Ok(())
}

/**
 * Check user-supplied additions against the environment policy. With
 * the setenv privilege everything goes; without it, any name outside
 * the whitelist sinks the request. The offending names are returned
 * for the denial message.
 */
pub fn validate_env_vars(def: &Defaults, setenv: bool, vars: &[String]) -> Result<(), Vec<String>> {
    if setenv {
        return Ok(());
    }

    let mut rejected = Vec::new();
    for entry in vars {
        let (name, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
        if !keep_in_reset(def, name, value) {
            rejected.push(name.to_string());
        }
    }

    if rejected.is_empty() {
        Ok(())
    } else {
        Err(rejected)
    }
}

/**
 * Apply user additions, last so they override everything.
 */
pub fn insert_env_vars(env: &mut Environment, vars: &[String]) {
    for entry in vars {
        if let Some((name, value)) = entry.split_once('=') {
            env.set(name, value);
        }
    }
}

/**
 * Login-class environment, applied for login shells on platforms that
 * have a class database.
 */
pub fn apply_login_class(
    env: &mut Environment,
    db: &dyn LoginClassDb,
    class: &str,
    user: &User,
) {
    for (name, value) in db.env_for(class, user) {
        env.set(&name, &value);
    }
}
