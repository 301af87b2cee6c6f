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
 * Layered key/value settings.
 *
 * Settings arrive in layers: compiled-in values, overrides from the
 * front-end, generic entries from each rule source, then host-, user-,
 * runas- and per-command-scoped entries as their bindings match. Later
 * layers override earlier ones; application order is total.
 *
 * Each successful set records its origin for diagnostics and pushes the
 * setting name onto a change list the orchestrator drains after the
 * layer, so reactions to a change (re-resolving the default target user,
 * for instance) happen exactly once per set.
 *
 * A value that fails validation is logged and skipped, it never aborts
 * the layer. Re-initialization runs the same path with logging disabled
 * so an intercepted sub-command does not repeat old noise.
 */

use std::collections::HashMap;

use bitflags::bitflags;
use tracing::warn;

use crate::modules::rules::{Binding, DefaultsEntry, DefaultsOp, DefaultsValue, Origin};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SetScope: u32 {
        const GENERIC = 0x01;
        const HOST    = 0x02;
        const USER    = 0x04;
        const RUNAS   = 0x08;
        const CMND    = 0x10;
    }
}

impl SetScope {
    pub fn non_cmnd() -> SetScope {
        SetScope::GENERIC | SetScope::HOST | SetScope::USER | SetScope::RUNAS
    }

    pub fn of(binding: &Binding) -> SetScope {
        match binding {
            Binding::Generic => SetScope::GENERIC,
            Binding::Host(_) => SetScope::HOST,
            Binding::User(_) => SetScope::USER,
            Binding::Runas(_) => SetScope::RUNAS,
            Binding::Cmnd(_) => SetScope::CMND,
        }
    }
}

/**
 * When a password is required for list/validate style requests.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswdCheck {
    Never,
    Any,
    All,
    Always,
}

impl PasswdCheck {
    fn parse(s: &str) -> Option<PasswdCheck> {
        match s {
            "never" => Some(PasswdCheck::Never),
            "any" => Some(PasswdCheck::Any),
            "all" => Some(PasswdCheck::All),
            "always" => Some(PasswdCheck::Always),
            _ => None,
        }
    }
}

const ENV_DELETE_STOCK: &[&str] = &[
    "IFS", "CDPATH", "LOCALDOMAIN", "RES_OPTIONS", "HOSTALIASES", "NLSPATH",
    "PATH_LOCALE", "LD_*", "_RLD*", "TERMINFO", "TERMINFO_DIRS", "TERMPATH",
    "TERMCAP", "ENV", "BASH_ENV", "PS4", "SHELLOPTS", "JAVA_TOOL_OPTIONS",
    "PERLIO_DEBUG", "PERLLIB", "PERL5LIB", "PERL5OPT", "PERL5DB", "FPATH",
    "NULLCMD", "READNULLCMD", "ZDOTDIR", "RUBYLIB", "RUBYOPT", "PYTHONHOME",
    "PYTHONPATH", "PYTHONINSPECT", "PYTHONUSERBASE",
];

const ENV_CHECK_STOCK: &[&str] = &[
    "COLORTERM", "LANG", "LANGUAGE", "LC_*", "LINGUAS", "TERM", "TZ",
];

const ENV_KEEP_STOCK: &[&str] = &[
    "COLORS", "DISPLAY", "HOSTNAME", "KRB5CCNAME", "LS_COLORS", "PS1", "PS2",
    "XAUTHORITY", "XAUTHORIZATION", "XDG_CURRENT_DESKTOP",
];

/**
 * The settings store. Field names double as the setting names accepted
 * by `set_by_name`.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct Defaults {
    pub root_sudo: bool,
    pub ignore_dot: bool,
    pub env_reset: bool,
    pub requiretty: bool,
    pub authenticate: bool,
    pub setenv: bool,
    pub runas_allow_unknown_id: bool,
    pub shell_noargs: bool,
    pub closefrom_override: bool,
    pub umask_override: bool,
    pub ignore_iolog_errors: bool,
    pub log_input: bool,
    pub log_output: bool,
    pub env_editor: bool,
    pub use_loginclass: bool,
    pub intercept: bool,
    pub user_command_timeouts: bool,
    pub preserve_groups: bool,
    pub set_logname: bool,
    pub set_home: bool,
    pub always_set_home: bool,
    pub use_pty: bool,
    pub set_utmp: bool,

    pub closefrom: i32,
    pub passwd_tries: u32,
    pub command_timeout: u32,
    pub umask: u32,

    pub runas_default: String,
    pub editor: String,
    pub iolog_dir: String,
    pub iolog_file: String,
    pub sudoers_locale: String,
    pub secure_path: Option<String>,
    pub env_file: Option<String>,
    pub restricted_env_file: Option<String>,
    pub runchroot: Option<String>,
    pub runcwd: Option<String>,
    pub admin_flag: Option<String>,

    pub verifypw: PasswdCheck,
    pub listpw: PasswdCheck,

    pub env_keep: Vec<String>,
    pub env_check: Vec<String>,
    pub env_delete: Vec<String>,

    origins: HashMap<String, Origin>,
    changed: Vec<String>,
}

impl Default for Defaults {
    fn default() -> Defaults {
        Defaults::new()
    }
}

impl Defaults {
    pub fn new() -> Defaults {
        let mut def = Defaults {
            root_sudo: true,
            ignore_dot: true,
            env_reset: true,
            requiretty: false,
            authenticate: true,
            setenv: false,
            runas_allow_unknown_id: false,
            shell_noargs: false,
            closefrom_override: false,
            umask_override: false,
            ignore_iolog_errors: false,
            log_input: false,
            log_output: false,
            env_editor: false,
            use_loginclass: false,
            intercept: false,
            user_command_timeouts: false,
            preserve_groups: false,
            set_logname: true,
            set_home: false,
            always_set_home: false,
            use_pty: false,
            set_utmp: false,

            closefrom: 3,
            passwd_tries: 3,
            command_timeout: 0,
            umask: 0o022,

            runas_default: "root".to_string(),
            editor: crate::modules::shared::DEFAULT_EDITOR.to_string(),
            iolog_dir: "/var/log/runas-io".to_string(),
            iolog_file: "%{seq}".to_string(),
            sudoers_locale: "C".to_string(),
            secure_path: None,
            env_file: None,
            restricted_env_file: None,
            runchroot: None,
            runcwd: None,
            admin_flag: None,

            verifypw: PasswdCheck::All,
            listpw: PasswdCheck::Any,

            env_keep: Vec::new(),
            env_check: Vec::new(),
            env_delete: Vec::new(),

            origins: HashMap::new(),
            changed: Vec::new(),
        };
        def.reset_env_lists();
        def
    }

    fn reset_env_lists(&mut self) {
        self.env_keep = ENV_KEEP_STOCK.iter().map(|s| s.to_string()).collect();
        self.env_check = ENV_CHECK_STOCK.iter().map(|s| s.to_string()).collect();
        self.env_delete = ENV_DELETE_STOCK.iter().map(|s| s.to_string()).collect();
    }

    /**
     * Reset to compiled-in values. The change list is cleared as well;
     * everything is considered fresh after this.
     */
    pub fn init(&mut self) {
        *self = Defaults::new();
    }

    pub fn origin_of(&self, name: &str) -> Option<&Origin> {
        self.origins.get(name)
    }

    /**
     * Names set since the last drain, in application order.
     */
    pub fn take_changed(&mut self) -> Vec<String> {
        std::mem::take(&mut self.changed)
    }

    /**
     * Apply one layer of entries. Entries whose scope is not in `scope`
     * or whose binding does not match (per `binding_match`) are skipped.
     * Returns the number of entries applied.
     */
    pub fn apply(
        &mut self,
        entries: &[DefaultsEntry],
        scope: SetScope,
        quiet: bool,
        mut binding_match: impl FnMut(&Binding) -> bool,
    ) -> usize {
        let mut applied = 0;

        for entry in entries {
            if !scope.contains(SetScope::of(&entry.binding)) {
                continue;
            }
            if !binding_match(&entry.binding) {
                continue;
            }
            if self.set_entry(entry, quiet) {
                applied += 1;
            }
        }

        applied
    }

    fn set_entry(&mut self, entry: &DefaultsEntry, quiet: bool) -> bool {
        let ok = self.set_by_name(&entry.name, entry.op, &entry.value);
        if ok {
            self.origins.insert(entry.name.clone(), entry.origin.clone());
            self.changed.push(entry.name.clone());
        } else if !quiet {
            warn!(
                setting = entry.name.as_str(),
                origin = %entry.origin,
                "ignoring invalid settings entry"
            );
        }
        ok
    }

    fn set_by_name(&mut self, name: &str, op: DefaultsOp, value: &DefaultsValue) -> bool {
        macro_rules! flag {
            ($field:ident) => {
                match op {
                    DefaultsOp::Enable => {
                        self.$field = true;
                        true
                    }
                    DefaultsOp::Disable => {
                        self.$field = false;
                        true
                    }
                    _ => false,
                }
            };
        }

        macro_rules! text {
            ($field:ident) => {
                match (op, value) {
                    (DefaultsOp::Assign, DefaultsValue::Str(s)) => {
                        self.$field = s.clone();
                        true
                    }
                    _ => false,
                }
            };
        }

        macro_rules! opt_text {
            ($field:ident) => {
                match (op, value) {
                    (DefaultsOp::Assign, DefaultsValue::Str(s)) => {
                        self.$field = Some(s.clone());
                        true
                    }
                    (DefaultsOp::Disable, _) => {
                        self.$field = None;
                        true
                    }
                    _ => false,
                }
            };
        }

        macro_rules! list {
            ($field:ident) => {
                match (op, value) {
                    (DefaultsOp::Assign, DefaultsValue::Str(s)) => {
                        self.$field = s.split_whitespace().map(str::to_string).collect();
                        true
                    }
                    (DefaultsOp::Assign, DefaultsValue::List(items)) => {
                        self.$field = items.clone();
                        true
                    }
                    (DefaultsOp::Append, DefaultsValue::Str(s)) => {
                        for item in s.split_whitespace() {
                            if !self.$field.iter().any(|v| v == item) {
                                self.$field.push(item.to_string());
                            }
                        }
                        true
                    }
                    (DefaultsOp::Append, DefaultsValue::List(items)) => {
                        for item in items {
                            if !self.$field.contains(item) {
                                self.$field.push(item.clone());
                            }
                        }
                        true
                    }
                    (DefaultsOp::Remove, DefaultsValue::Str(s)) => {
                        let drop: Vec<&str> = s.split_whitespace().collect();
                        self.$field.retain(|v| !drop.contains(&v.as_str()));
                        true
                    }
                    (DefaultsOp::Remove, DefaultsValue::List(items)) => {
                        self.$field.retain(|v| !items.contains(v));
                        true
                    }
                    (DefaultsOp::Disable, _) => {
                        self.$field.clear();
                        true
                    }
                    _ => false,
                }
            };
        }

        match name {
            "root_sudo" => flag!(root_sudo),
            "ignore_dot" => flag!(ignore_dot),
            "env_reset" => flag!(env_reset),
            "requiretty" => flag!(requiretty),
            "authenticate" => flag!(authenticate),
            "setenv" => flag!(setenv),
            "runas_allow_unknown_id" => flag!(runas_allow_unknown_id),
            "shell_noargs" => flag!(shell_noargs),
            "closefrom_override" => flag!(closefrom_override),
            "umask_override" => flag!(umask_override),
            "ignore_iolog_errors" => flag!(ignore_iolog_errors),
            "log_input" => flag!(log_input),
            "log_output" => flag!(log_output),
            "env_editor" => flag!(env_editor),
            "use_loginclass" => flag!(use_loginclass),
            "intercept" => flag!(intercept),
            "user_command_timeouts" => flag!(user_command_timeouts),
            "preserve_groups" => flag!(preserve_groups),
            "set_logname" => flag!(set_logname),
            "set_home" => flag!(set_home),
            "always_set_home" => flag!(always_set_home),
            "use_pty" => flag!(use_pty),
            "set_utmp" => flag!(set_utmp),

            "closefrom" => match (op, value) {
                (DefaultsOp::Assign, DefaultsValue::Str(s)) => match s.parse::<i32>() {
                    Ok(n) if n >= 0 => {
                        self.closefrom = n;
                        true
                    }
                    _ => false,
                },
                _ => false,
            },
            "passwd_tries" => match (op, value) {
                (DefaultsOp::Assign, DefaultsValue::Str(s)) => match s.parse::<u32>() {
                    Ok(n) => {
                        self.passwd_tries = n;
                        true
                    }
                    _ => false,
                },
                _ => false,
            },
            "command_timeout" => match (op, value) {
                (DefaultsOp::Assign, DefaultsValue::Str(s)) => match s.parse::<u32>() {
                    Ok(n) => {
                        self.command_timeout = n;
                        true
                    }
                    _ => false,
                },
                _ => false,
            },
            "umask" => match (op, value) {
                (DefaultsOp::Assign, DefaultsValue::Str(s)) => {
                    match u32::from_str_radix(s.trim_start_matches("0o"), 8) {
                        Ok(mask) if mask <= 0o777 => {
                            self.umask = mask;
                            true
                        }
                        _ => false,
                    }
                }
                _ => false,
            },

            "runas_default" => text!(runas_default),
            "editor" => text!(editor),
            "iolog_dir" => text!(iolog_dir),
            "iolog_file" => text!(iolog_file),
            "sudoers_locale" => text!(sudoers_locale),
            "secure_path" => opt_text!(secure_path),
            "env_file" => opt_text!(env_file),
            "restricted_env_file" => opt_text!(restricted_env_file),
            "runchroot" => opt_text!(runchroot),
            "runcwd" => opt_text!(runcwd),
            "admin_flag" => opt_text!(admin_flag),

            "verifypw" => match (op, value) {
                (DefaultsOp::Assign, DefaultsValue::Str(s)) => match PasswdCheck::parse(s) {
                    Some(v) => {
                        self.verifypw = v;
                        true
                    }
                    None => false,
                },
                (DefaultsOp::Disable, _) => {
                    self.verifypw = PasswdCheck::Never;
                    true
                }
                _ => false,
            },
            "listpw" => match (op, value) {
                (DefaultsOp::Assign, DefaultsValue::Str(s)) => match PasswdCheck::parse(s) {
                    Some(v) => {
                        self.listpw = v;
                        true
                    }
                    None => false,
                },
                (DefaultsOp::Disable, _) => {
                    self.listpw = PasswdCheck::Never;
                    true
                }
                _ => false,
            },

            "env_keep" => list!(env_keep),
            "env_check" => list!(env_check),
            "env_delete" => list!(env_delete),

            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::rules::DefaultsEntry;

    fn origin() -> Origin {
        Origin::new("/etc/rules", 1, 1)
    }

    #[test]
    fn later_layers_override_earlier() {
        let mut def = Defaults::new();
        assert!(def.root_sudo);

        let layer1 = vec![DefaultsEntry::flag("root_sudo", false, origin())];
        let layer2 = vec![DefaultsEntry::flag("root_sudo", true, origin())];

        def.apply(&layer1, SetScope::non_cmnd(), false, |_| true);
        assert!(!def.root_sudo);
        def.apply(&layer2, SetScope::non_cmnd(), false, |_| true);
        assert!(def.root_sudo);
    }

    #[test]
    fn apply_is_idempotent() {
        let entries = vec![
            DefaultsEntry::flag("env_reset", false, origin()),
            DefaultsEntry::assign("secure_path", "/bin:/usr/bin", origin()),
            DefaultsEntry::assign("umask", "077", origin()),
        ];

        let mut a = Defaults::new();
        a.apply(&entries, SetScope::non_cmnd(), false, |_| true);
        let mut b = a.clone();
        b.apply(&entries, SetScope::non_cmnd(), false, |_| true);

        b.changed.clear();
        a.changed.clear();
        assert_eq!(a, b);
    }

    #[test]
    fn scope_mask_filters_entries() {
        let mut cmnd_entry = DefaultsEntry::flag("env_reset", false, origin());
        cmnd_entry.binding = Binding::Cmnd(Vec::new());

        let mut def = Defaults::new();
        let applied = def.apply(&[cmnd_entry.clone()], SetScope::non_cmnd(), false, |_| true);
        assert_eq!(applied, 0);
        assert!(def.env_reset);

        let applied = def.apply(&[cmnd_entry], SetScope::CMND, false, |_| true);
        assert_eq!(applied, 1);
        assert!(!def.env_reset);
    }

    #[test]
    fn invalid_value_is_skipped_not_fatal() {
        let entries = vec![
            DefaultsEntry::assign("passwd_tries", "lots", origin()),
            DefaultsEntry::assign("passwd_tries", "5", origin()),
        ];

        let mut def = Defaults::new();
        let applied = def.apply(&entries, SetScope::non_cmnd(), true, |_| true);
        assert_eq!(applied, 1);
        assert_eq!(def.passwd_tries, 5);
    }

    #[test]
    fn change_list_drains_in_order() {
        let entries = vec![
            DefaultsEntry::assign("runas_default", "operator", origin()),
            DefaultsEntry::flag("requiretty", true, origin()),
        ];

        let mut def = Defaults::new();
        def.apply(&entries, SetScope::non_cmnd(), false, |_| true);
        assert_eq!(def.take_changed(), vec!["runas_default", "requiretty"]);
        assert!(def.take_changed().is_empty());
    }

    #[test]
    fn env_list_append_and_remove() {
        let mut def = Defaults::new();
        let add = DefaultsEntry {
            binding: Binding::Generic,
            name: "env_keep".to_string(),
            op: DefaultsOp::Append,
            value: DefaultsValue::Str("EDITOR VISUAL".to_string()),
            origin: origin(),
        };
        def.apply(&[add], SetScope::non_cmnd(), false, |_| true);
        assert!(def.env_keep.iter().any(|v| v == "EDITOR"));

        let del = DefaultsEntry {
            binding: Binding::Generic,
            name: "env_keep".to_string(),
            op: DefaultsOp::Remove,
            value: DefaultsValue::Str("EDITOR".to_string()),
            origin: origin(),
        };
        def.apply(&[del], SetScope::non_cmnd(), false, |_| true);
        assert!(!def.env_keep.iter().any(|v| v == "EDITOR"));
    }

    #[test]
    fn umask_parses_octal() {
        let mut def = Defaults::new();
        def.apply(
            &[DefaultsEntry::assign("umask", "027", origin())],
            SetScope::non_cmnd(),
            false,
            |_| true,
        );
        assert_eq!(def.umask, 0o027);
    }
}
