// Copyright (c) 2025 Daniel Bergløv
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
 * The request pipeline.
 *
 * One `Engine` handles the whole life of a front-end connection:
 * `init` digests the settings and user-info bundles, opens the rule
 * sources and resolves both sides of the identity question; `check`,
 * `validate`, `list` and `invalidate` each run the common pipeline
 * under a privilege bracket that is unwound on every exit path.
 *
 * Security checks run in a fixed order. Moving one, or returning early
 * around one, is how privilege tools grow holes; anything that bails
 * out goes through the same teardown.
 *
 * When an approved command is allowed to spawn further commands, the
 * front-end re-enters `check` for each child. That re-entry resets the
 * settings store quietly and restricts the mode to the re-entry subset
 * before the pipeline runs again.
 */

use std::rc::Rc;

use nix::unistd::{Gid, Uid};
use tracing::{debug, warn};

use crate::modules::auth::{
    can_prompt, check_user, expand_prompt, tty_present, AuthDecision, Authenticator,
    TimestampStore,
};
use crate::modules::defaults::{Defaults, PasswdCheck, SetScope};
use crate::modules::emit::{
    command_umask, AuditEvent, AuditSink, Decision, ExecPlan,
};
use crate::modules::env::{
    apply_login_class, insert_env_vars, read_env_file, rebuild_env, validate_env_vars,
    Environment, EnvParams, LoginClassDb,
};
use crate::modules::error::{
    Error, InputError, PolicyError, ResolutionError, ResourceError, UsageError,
};
use crate::modules::iolog::{expand_iolog_path, IologEscapes};
use crate::modules::lookup::{binding_matches, lookup, LookupRequest, MatchInfo, ValidationFlags};
use crate::modules::path::{
    find_editor, login_shell_argv0, reshape_login_shell, resolve_command, CommandStatus,
};
use crate::modules::perms::{Creds, CredOps, PermStack, PermState};
use crate::modules::rules::{Binding, DefaultsEntry, DefaultsOp, DefaultsValue, Origin};
use crate::modules::shared::{
    basename, strvec_join, LocaleGuard, ModeFlags, DEFAULT_PROMPT, PATH_ENVIRONMENT, PATH_STOCK,
};
use crate::modules::sources::{RuleSource, SourceList};
use crate::modules::user::{NameService, User, UserDb};
use crate::modules::wire::{
    parse_settings, parse_user_info, CommandInfo, FrontendSettings,
};

/**
 * Invoking-side request facts.
 */
pub struct UserContext {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
    pub gids: Vec<Gid>,
    pub pw: Rc<User>,
    pub tty: Option<String>,
    pub ttypath: Option<String>,
    pub tcpgid: Option<i32>,
    pub cwd: Option<String>,
    pub host: String,
    pub shost: String,
    pub path: Option<String>,
    pub prompt: Option<String>,
    pub ccname: Option<String>,
    pub prev_user: Option<String>,
    pub closefrom: Option<i32>,
    pub timeout: Option<u32>,
    pub umask: Option<u32>,
    pub env_vars: Vec<String>,
    pub cmnd: Option<String>,
    pub cmnd_args: Option<String>,
    pub cmnd_base: String,
    pub cmnd_dir: Option<String>,
    pub cmnd_stat: Option<nix::sys::stat::FileStat>,
    pub cmnd_list: Option<String>,
    pub source: Option<String>,
}

/**
 * Target-side request facts, rebuilt on every request.
 */
#[derive(Default)]
pub struct RunasContext {
    pub user_req: Option<String>,
    pub group_req: Option<String>,
    pub pw: Option<Rc<User>>,
    pub gr: Option<Rc<crate::modules::user::Group>>,
    pub class: Option<String>,
    pub chroot: Option<String>,
    pub cwd: Option<String>,
    pub role: Option<String>,
    pub selinux_type: Option<String>,
    pub apparmor_profile: Option<String>,
    pub cmnd: Option<String>,
}

/**
 * Everything the engine cannot decide on its own.
 */
pub struct EngineConfig {
    pub nss: Box<dyn NameService>,
    pub cred_ops: Box<dyn CredOps>,
    pub sources: Vec<Box<dyn RuleSource>>,
    pub authenticator: Box<dyn Authenticator>,
    pub timestamps: Box<dyn TimestampStore>,
    pub audit: Box<dyn AuditSink>,
    pub login_classes: Box<dyn LoginClassDb>,
    /**
     * Acceptable target shells; `None` accepts anything.
     */
    pub valid_shells: Option<Vec<String>>,
    /**
     * Next I/O-log session sequence, if session logging is in play.
     */
    pub iolog_seq: Option<String>,
}

/**
 * The policy engine. One instance per front-end connection; request
 * entry points may be called repeatedly.
 */
pub struct Engine {
    db: UserDb,
    perms: PermStack,
    def: Defaults,
    sources: SourceList,
    auth: Box<dyn Authenticator>,
    ts: Box<dyn TimestampStore>,
    audit: Box<dyn AuditSink>,
    classes: Box<dyn LoginClassDb>,
    valid_shells: Option<Vec<String>>,
    iolog_seq: Option<String>,

    mode: ModeFlags,
    settings: FrontendSettings,
    uc: Option<UserContext>,
    rc: RunasContext,
    initial_defaults: Vec<DefaultsEntry>,
    env: Environment,
    env_out: Option<Environment>,
    new_argv: Vec<String>,
    cmnd_status: CommandStatus,
    match_info: Option<MatchInfo>,
    unknown_runas_uid: bool,
    unknown_runas_gid: bool,
    need_reinit: bool,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Engine, Error> {
        Ok(Engine {
            db: UserDb::new(config.nss),
            perms: PermStack::new(config.cred_ops)?,
            def: Defaults::new(),
            sources: SourceList::new(config.sources),
            auth: config.authenticator,
            ts: config.timestamps,
            audit: config.audit,
            classes: config.login_classes,
            valid_shells: config.valid_shells,
            iolog_seq: config.iolog_seq,

            mode: ModeFlags::NONE,
            settings: FrontendSettings::default(),
            uc: None,
            rc: RunasContext::default(),
            initial_defaults: Vec::new(),
            env: Environment::default(),
            env_out: None,
            new_argv: Vec::new(),
            cmnd_status: CommandStatus::NotFound,
            match_info: None,
            unknown_runas_uid: false,
            unknown_runas_gid: false,
            need_reinit: false,
        })
    }

    pub fn mode(&self) -> ModeFlags {
        self.mode
    }

    /**
     * Digest the front-end bundles, open the rule sources and resolve
     * the invoking and target identities. Must run before any request
     * entry point.
     */
    pub fn init(
        &mut self,
        settings: &[String],
        user_info: &[String],
        envp: &[String],
    ) -> Result<(), Error> {
        let settings = parse_settings(settings)?;
        let info = parse_user_info(user_info)?;

        self.mode = settings.flags;
        self.env = Environment::from_envp(envp);
        self.def.init();
        self.initial_defaults = frontend_defaults(&settings.defaults);

        self.build_user_context(&settings, &info, envp)?;
        self.rc = RunasContext {
            user_req: settings.runas_user.clone(),
            group_req: settings.runas_group.clone(),
            class: settings.login_class.clone(),
            chroot: settings.cmnd_chroot.clone(),
            cwd: settings.cmnd_cwd.clone(),
            role: settings.selinux_role.clone(),
            selinux_type: settings.selinux_type.clone(),
            apparmor_profile: settings.apparmor_profile.clone(),
            ..RunasContext::default()
        };
        self.settings = settings;

        // The front-end layer lands before anything from the sources.
        self.apply_defaults_layer(true, SetScope::non_cmnd(), false)?;
        self.resolve_runas()?;

        // Policy files are read as their owner when one is configured,
        // as root otherwise.
        let (state, creds) = match self.settings.sudoers_uid {
            Some(_) => (PermState::Sudoers, self.sudoers_creds()),
            None => (PermState::Root, self.root_creds()),
        };
        self.perms.push(state, creds)?;
        let result = self.open_sources();
        self.perms.pop()?;
        result?;

        self.handle_changed_defaults()?;
        self.set_loginclass()?;

        Ok(())
    }

    /**
     * Decide one command request: resolve, look up, authenticate,
     * build the environment, emit the plan.
     */
    pub fn check(&mut self, argv: &[String], env_add: &[String]) -> Result<Decision, Error> {
        self.ensure_init()?;
        if argv.is_empty() {
            return Err(InputError::NoCommand.into());
        }

        self.maybe_reinit()?;
        self.perms.unlimit_nproc()?;
        let entry = self.perms.entry_creds().clone();
        self.perms.push(PermState::Initial, entry)?;

        let result = self.check_run(argv, env_add);
        self.teardown_request();
        result
    }

    /**
     * Re-check the user's standing and refresh the credential cache.
     */
    pub fn validate(&mut self) -> Result<bool, Error> {
        self.ensure_init()?;

        self.maybe_reinit()?;
        self.perms.unlimit_nproc()?;
        let entry = self.perms.entry_creds().clone();
        self.perms.push(PermState::Initial, entry)?;

        let saved_mode = self.mode;
        self.mode.remove(ModeFlags::RUN | ModeFlags::EDIT | ModeFlags::LIST | ModeFlags::CHECK);
        self.mode |= ModeFlags::VALIDATE;

        self.new_argv = vec!["validate".to_string()];
        let verifypw = self.def.verifypw;
        let result = self.check_common(Some(verifypw));

        self.mode = saved_mode;
        self.teardown_request();
        result
    }

    /**
     * Drop the user's cached credential.
     */
    pub fn invalidate(&mut self) -> Result<(), Error> {
        self.ensure_init()?;
        let uc = self.uc.as_ref().expect("initialized");
        self.ts.invalidate(&uc.pw);
        Ok(())
    }

    /**
     * List standing privileges, or decide whether one given command
     * would be allowed (`argv` non-empty).
     */
    pub fn list(
        &mut self,
        argv: &[String],
        list_user: Option<&str>,
        verbose: bool,
    ) -> Result<bool, Error> {
        self.ensure_init()?;

        let _list_pw = match list_user {
            Some(name) => match self.db.user_by_name(name).map_err(|err| ResourceError::Io {
                path: "user database".to_string(),
                err,
            })? {
                Some(pw) => Some(pw),
                None => return Err(InputError::UnknownUser(name.to_string()).into()),
            },
            None => None,
        };
        debug!(verbose, "privilege listing requested");

        self.maybe_reinit()?;
        self.perms.unlimit_nproc()?;
        let entry = self.perms.entry_creds().clone();
        self.perms.push(PermState::Initial, entry)?;

        let saved_mode = self.mode;
        self.mode.remove(ModeFlags::RUN | ModeFlags::EDIT | ModeFlags::VALIDATE);
        self.mode |= ModeFlags::LIST;

        let check = !argv.is_empty();
        if check {
            self.mode |= ModeFlags::CHECK;
        }
        self.new_argv = Vec::with_capacity(argv.len() + 2);
        self.new_argv.push("list".to_string());
        self.new_argv.extend(argv.iter().cloned());

        let listpw = self.def.listpw;
        let pwcheck = if check { None } else { Some(listpw) };
        let result = self.check_common(pwcheck);

        self.mode = saved_mode;
        self.teardown_request();
        result
    }

    /**
     * Release everything a request chain accumulated. Also registered
     * for fatal unwinds; the privilege stack is returned to its entry
     * state no matter what the pipeline was doing.
     */
    pub fn cleanup(&mut self) {
        if let Err(err) = self.perms.rewind() {
            warn!(%err, "privilege stack not restored cleanly");
        }
        self.sources.close_all();
        self.db.clear();
        self.uc = None;
        self.rc = RunasContext::default();
        self.env_out = None;
        self.new_argv.clear();
        self.match_info = None;
        self.need_reinit = false;
    }

    fn teardown_request(&mut self) {
        if let Err(err) = self.perms.rewind() {
            warn!(%err, "privilege stack not restored cleanly");
        }
        if let Err(err) = self.perms.restore_nproc() {
            warn!(%err, "process limit not restored");
        }
    }

    fn check_run(&mut self, argv: &[String], env_add: &[String]) -> Result<Decision, Error> {
        {
            let uc = self.uc.as_mut().expect("initialized");
            uc.env_vars = env_add.to_vec();
        }

        // One spare slot so a login-shell reshape never reallocates.
        self.new_argv = Vec::with_capacity(argv.len() + 2);
        self.new_argv.extend(argv.iter().cloned());
        if self.mode.contains(ModeFlags::LOGIN_SHELL) {
            if let Some(pw) = self.rc.pw.as_ref() {
                self.new_argv[0] = pw.shell.clone();
            }
        }

        if !self.check_common(None)? {
            return Ok(Decision::Deny);
        }

        let iolog_path = self.format_iolog_path()?;
        let umask = {
            let uc = self.uc.as_ref().expect("initialized");
            command_umask(self.def.umask, self.def.umask_override, uc.umask)
        };

        if self.mode.contains(ModeFlags::LOGIN_SHELL) {
            self.new_argv[0] = login_shell_argv0(&self.new_argv[0]);
            reshape_login_shell(&mut self.new_argv);

            if let Some(env_out) = self.env_out.as_mut() {
                if let Err(err) =
                    read_env_file(PATH_ENVIRONMENT, true, false, &self.def, env_out)
                {
                    debug!(%err, "no system environment file applied");
                }
                if let (Some(class), Some(pw)) = (self.rc.class.as_ref(), self.rc.pw.as_ref()) {
                    apply_login_class(env_out, self.classes.as_ref(), class, pw);
                }
            }
        }

        if let Some(env_out) = self.env_out.as_mut() {
            if let Some(path) = self.def.restricted_env_file.clone() {
                if let Err(err) = read_env_file(&path, false, true, &self.def, env_out) {
                    warn!(%err, "restricted environment file skipped");
                }
            }
            if let Some(path) = self.def.env_file.clone() {
                if let Err(err) = read_env_file(&path, false, false, &self.def, env_out) {
                    warn!(%err, "environment file skipped");
                }
            }
        }

        {
            let Engine { uc, env_out, .. } = self;
            let uc = uc.as_ref().expect("initialized");
            if let Some(env_out) = env_out.as_mut() {
                insert_env_vars(env_out, &uc.env_vars);
            }
        }

        if self.mode.contains(ModeFlags::EDIT) {
            self.prepare_editor()?;
        }

        self.create_admin_flag();

        let plan = self.store_result(umask, iolog_path)?;

        {
            let Engine { uc, audit, new_argv, rc, .. } = self;
            let uc = uc.as_ref().expect("initialized");
            let event = AuditEvent::success(&uc.name, new_argv, rc.cmnd.as_deref());
            audit.audit_success(&event);
        }

        Ok(Decision::Allow(Box::new(plan)))
    }

    /**
     * The shared decision pipeline. `Ok(true)` allows, `Ok(false)`
     * denies (already audited and logged), errors unwind.
     */
    fn check_common(&mut self, pwcheck: Option<PasswdCheck>) -> Result<bool, Error> {
        if self.mode.contains(ModeFlags::PRESERVE_GROUPS) {
            self.def.preserve_groups = true;
        }

        self.cmnd_status = self.set_cmnd()?;

        // Is root even allowed to elevate?
        {
            let uc = self.uc.as_ref().expect("initialized");
            if uc.uid.is_root() && !self.def.root_sudo {
                // Not an audit event.
                warn!("sudoers specifies that root is not allowed to sudo");
                return Ok(false);
            }
        }

        if let Some(closefrom) = self.uc.as_ref().expect("initialized").closefrom {
            if closefrom != self.def.closefrom {
                if !self.def.closefrom_override {
                    self.deny("user not allowed to override closefrom limit");
                    warn!("you are not permitted to use the -C option");
                    return Ok(false);
                }
                self.def.closefrom = closefrom;
            }
        }

        let (validated, match_info) = self.run_lookup(pwcheck);
        if validated.contains(ValidationFlags::ERROR) {
            return Err(PolicyError::LookupFailed("rule sources unusable".to_string()).into());
        }
        self.match_info = match_info;

        {
            let Engine { uc, match_info, .. } = self;
            let uc = uc.as_mut().expect("initialized");
            if let Some(info) = match_info.as_ref() {
                uc.source = Some(info.origin.to_string());
            }
        }

        if self.rc.cmnd.is_none() {
            let uc = self.uc.as_ref().expect("initialized");
            self.rc.cmnd = uc.cmnd.clone();
        }

        // Unknown numeric target ids were tolerated until the settings
        // layers were all in; enforce them now.
        if self.unknown_runas_uid && !self.def.runas_allow_unknown_id {
            let name = self.rc.pw.as_ref().map(|pw| pw.name.clone()).unwrap_or_default();
            self.deny(&format!("unknown user {name}"));
            return Ok(false);
        }
        if self.rc.gr.is_some() && self.unknown_runas_gid && !self.def.runas_allow_unknown_id {
            let name = self.rc.gr.as_ref().map(|gr| gr.name.clone()).unwrap_or_default();
            self.deny(&format!("unknown group {name}"));
            return Ok(false);
        }

        if self.mode.contains(ModeFlags::IMPLIED_SHELL) && !self.def.shell_noargs {
            // Usage problem, not a policy decision.
            return Err(UsageError::ImpliedShellNotAllowed.into());
        }

        if self.def.requiretty {
            let uc = self.uc.as_ref().expect("initialized");
            if !tty_present(uc.tcpgid, uc.ttypath.as_deref()) {
                self.deny("no tty");
                warn!("sorry, you must have a tty to run this command");
                return Ok(false);
            }
        }

        if self.mode.intersects(ModeFlags::RUN | ModeFlags::CHECK) {
            if let Some(pw) = self.rc.pw.clone() {
                if !self.shell_ok(&pw) {
                    self.deny(&format!("invalid shell for user {}: {}", pw.name, pw.shell));
                    return Ok(false);
                }
            }
        }

        // Tag-level grants fold into the settings before the
        // environment decisions below.
        if validated.contains(ValidationFlags::SETENV) {
            self.def.setenv = true;
        }
        if self.mode.contains(ModeFlags::EDIT)
            || (self.mode.contains(ModeFlags::PRESERVE_ENV) && self.def.setenv)
        {
            self.def.env_reset = false;
        }

        self.rebuild_environment();

        match self.run_auth_gate(validated)? {
            AuthDecision::Pass => {}
            AuthDecision::Denied { prompted } => {
                // The denial text is suppressed once a prompt was shown;
                // the retry loop already talked to the user.
                if !validated.contains(ValidationFlags::SUCCESS) && !prompted {
                    warn!("a password is required");
                }
                self.deny("authentication failed");
                return Ok(false);
            }
        }

        {
            let requested = self.rc.chroot.clone();
            let rule = self.match_info.as_ref().and_then(|m| m.runchroot.clone());
            let setting = self.def.runchroot.clone();
            if !crate::modules::auth::runchroot_allowed(
                requested.as_deref(),
                rule.as_deref(),
                setting.as_deref(),
            ) {
                let dir = requested.unwrap_or_default();
                self.deny(&format!("user not allowed to change root directory to {dir}"));
                warn!("you are not permitted to use the -R option");
                return Ok(false);
            }
        }
        {
            let requested = self.rc.cwd.clone();
            let rule = self.match_info.as_ref().and_then(|m| m.runcwd.clone());
            let setting = self.def.runcwd.clone();
            if !crate::modules::auth::runcwd_allowed(
                requested.as_deref(),
                rule.as_deref(),
                setting.as_deref(),
            ) {
                let dir = requested.unwrap_or_default();
                self.deny(&format!("user not allowed to change directory to {dir}"));
                warn!("you are not permitted to use the -D option");
                return Ok(false);
            }
        }

        self.rebind_prev_user();

        if !validated.contains(ValidationFlags::SUCCESS) {
            let uc = self.uc.as_ref().expect("initialized");
            let reason = if validated.contains(ValidationFlags::NO_USER) {
                format!("{} is not in the rule sources", uc.name)
            } else if validated.contains(ValidationFlags::NO_HOST) {
                format!("{} is not allowed on {}", uc.name, uc.host)
            } else {
                format!(
                    "{} is not allowed to run {}",
                    uc.name,
                    uc.cmnd.as_deref().unwrap_or("a command")
                )
            };
            self.deny(&reason);
            return Ok(false);
        }

        match self.cmnd_status {
            CommandStatus::FoundInDot => {
                self.deny("command in current directory");
                let uc = self.uc.as_ref().expect("initialized");
                let err = ResolutionError::FoundInDot {
                    cmnd: uc.cmnd_base.clone(),
                    hint: format!("runas ./{}", uc.cmnd_base),
                };
                warn!("{err}");
                return Ok(false);
            }
            CommandStatus::NotFound
                if self.mode.intersects(ModeFlags::RUN | ModeFlags::CHECK) =>
            {
                let (cmnd, base) = {
                    let uc = self.uc.as_ref().expect("initialized");
                    if self.mode.contains(ModeFlags::CHECK) {
                        let shown = self.new_argv.get(1).cloned().unwrap_or_default();
                        (shown.clone(), basename(&shown).to_string())
                    } else {
                        (uc.cmnd.clone().unwrap_or_default(), uc.cmnd_base.clone())
                    }
                };
                self.deny(&format!("{cmnd}: command not found"));
                if base == "cd" {
                    warn!("\"cd\" is a shell built-in command, it cannot be run directly");
                    warn!("a shell request may be used to run a privileged shell");
                    warn!("a working-directory request may be used to run a command in a specific directory");
                }
                return Ok(false);
            }
            _ => {}
        }

        if self.uc.as_ref().expect("initialized").timeout.is_some()
            && !self.def.user_command_timeouts
        {
            self.deny("user not allowed to set a command timeout");
            warn!("sorry, you are not allowed to set a command timeout");
            return Ok(false);
        }

        if self.mode.contains(ModeFlags::RUN) {
            if self.mode.contains(ModeFlags::PRESERVE_ENV) && !self.def.setenv {
                self.deny("user not allowed to preserve the environment");
                warn!("sorry, you are not allowed to preserve the environment");
                return Ok(false);
            }
            if !self.mode.contains(ModeFlags::PRESERVE_ENV) {
                let uc_vars = self.uc.as_ref().expect("initialized").env_vars.clone();
                if let Err(names) = validate_env_vars(&self.def, self.def.setenv, &uc_vars) {
                    self.deny(&format!(
                        "you are not allowed to set the following environment variables: {}",
                        names.join(", ")
                    ));
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    /**
     * Locate the command, capture its stat and argument string, and
     * pull in per-command settings entries.
     */
    fn set_cmnd(&mut self) -> Result<CommandStatus, Error> {
        self.rc.cmnd = None;
        let mut status = CommandStatus::Found;

        if self
            .mode
            .intersects(ModeFlags::RUN | ModeFlags::EDIT | ModeFlags::CHECK)
        {
            if !self.mode.contains(ModeFlags::EDIT) {
                status = self.resolve_cmnd_path()?;
            }

            let args = {
                let shell = self
                    .mode
                    .intersects(ModeFlags::SHELL | ModeFlags::LOGIN_SHELL)
                    && self.mode.contains(ModeFlags::RUN);
                let skip = if self.mode.contains(ModeFlags::CHECK) { 2 } else { 1 };
                let rest = self.new_argv.get(skip..).unwrap_or(&[]);
                if rest.is_empty() {
                    None
                } else {
                    Some(strvec_join(rest, shell))
                }
            };
            let uc = self.uc.as_mut().expect("initialized");
            uc.cmnd_args = args;
        }

        {
            let uc = self.uc.as_mut().expect("initialized");
            if uc.cmnd.is_none() {
                uc.cmnd = self.new_argv.first().cloned();
            }
            uc.cmnd_base = uc
                .cmnd
                .as_deref()
                .map(|c| basename(c).to_string())
                .unwrap_or_default();
        }

        // An edit helper reached through the run path is an edit
        // request that took a detour.
        if self.mode.contains(ModeFlags::RUN) {
            let is_edit_helper = {
                let uc = self.uc.as_ref().expect("initialized");
                uc.cmnd_base == "sudoedit"
            };
            if is_edit_helper {
                self.mode.remove(ModeFlags::RUN);
                self.mode |= ModeFlags::EDIT;
                warn!("the edit helper does not need to be elevated explicitly");
                let uc = self.uc.as_mut().expect("initialized");
                uc.cmnd = Some("sudoedit".to_string());
                uc.cmnd_base = "sudoedit".to_string();
            }
        }

        self.apply_defaults_layer(false, SetScope::CMND, false)?;
        self.handle_changed_defaults()?;

        Ok(status)
    }

    fn resolve_cmnd_path(&mut self) -> Result<CommandStatus, Error> {
        let chroot = self
            .rc
            .chroot
            .clone()
            .or_else(|| match self.def.runchroot.as_deref() {
                Some("*") | None => None,
                Some(dir) => Some(dir.to_string()),
            });

        let (cmnd_in, path_list) = {
            let uc = self.uc.as_ref().expect("initialized");
            let idx = usize::from(self.mode.contains(ModeFlags::CHECK));
            let cmnd_in = self
                .new_argv
                .get(idx)
                .cloned()
                .ok_or(InputError::NoCommand)?;
            let path_list = self
                .def
                .secure_path
                .clone()
                .or_else(|| uc.path.clone())
                .unwrap_or_else(|| PATH_STOCK.to_string());
            (cmnd_in, path_list)
        };

        let root = self.root_creds();
        let user = self.user_creds();
        let resolved = match resolve_command(
            &cmnd_in,
            &path_list,
            self.def.ignore_dot,
            chroot.as_deref(),
            &mut self.perms,
            root,
            user,
        ) {
            Ok(resolved) => resolved,
            Err(err) => {
                if matches!(
                    err,
                    Error::Resolution(ResolutionError::NameTooLong(_))
                ) {
                    self.deny("command too long");
                }
                return Err(err);
            }
        };

        let uc = self.uc.as_mut().expect("initialized");
        if self.mode.contains(ModeFlags::CHECK) {
            uc.cmnd_list = resolved.path.clone();
        } else {
            uc.cmnd = resolved.path.clone();
        }
        uc.cmnd_dir = resolved.dir.clone();
        uc.cmnd_stat = resolved.stat;

        Ok(resolved.status)
    }

    fn run_lookup(
        &mut self,
        pwcheck: Option<PasswdCheck>,
    ) -> (ValidationFlags, Option<MatchInfo>) {
        let _locale = LocaleGuard::enter(&self.def.sudoers_locale);
        let now = chrono::Local::now().timestamp();

        let Engine { db, sources, uc, rc, def, mode, .. } = self;
        let uc = uc.as_ref().expect("initialized");
        let runas_pw = rc.pw.as_ref().unwrap_or(&uc.pw);

        let cmnd_path = if mode.contains(ModeFlags::CHECK) {
            uc.cmnd_list.as_deref()
        } else {
            uc.cmnd.as_deref()
        };

        let req = LookupRequest {
            db,
            user: &uc.pw,
            user_gids: &uc.gids,
            host: &uc.host,
            shost: &uc.shost,
            runas_user: runas_pw,
            runas_group: rc.gr.as_deref(),
            runas_default: &def.runas_default,
            cmnd_path,
            cmnd_args: uc.cmnd_args.as_deref(),
            now,
        };

        lookup(sources, &req, pwcheck, |_| {})
    }

    fn run_auth_gate(&mut self, validated: ValidationFlags) -> Result<AuthDecision, Error> {
        let Engine { uc, rc, def, auth, ts, settings, mode, .. } = self;
        let uc = uc.as_ref().expect("initialized");
        let runas_pw = rc.pw.as_ref().unwrap_or(&uc.pw);

        let raw_prompt = uc.prompt.clone().unwrap_or_else(|| DEFAULT_PROMPT.to_string());
        let prompt = expand_prompt(&raw_prompt, &uc.name, &runas_pw.name, &uc.host, &uc.shost);
        let prompt_possible = tty_present(uc.tcpgid, uc.ttypath.as_deref())
            || can_prompt(settings.askpass.is_some());

        check_user(
            validated,
            *mode,
            &uc.pw,
            runas_pw,
            rc.gr.is_some(),
            uc.tty.as_deref(),
            prompt_possible,
            &prompt,
            def,
            auth.as_mut(),
            ts.as_mut(),
        )
    }

    fn rebuild_environment(&mut self) {
        let Engine { uc, rc, def, env, env_out, mode, .. } = self;
        let uc = uc.as_ref().expect("initialized");
        let runas_pw = rc.pw.as_ref().unwrap_or(&uc.pw);

        if mode.contains(ModeFlags::EDIT) {
            // The editor keeps the caller's environment; the reset
            // policy only governs the command path.
            *env_out = Some(env.clone());
            return;
        }

        let command = match (uc.cmnd.as_deref(), uc.cmnd_args.as_deref()) {
            (Some(cmnd), Some(args)) => format!("{cmnd} {args}"),
            (Some(cmnd), None) => cmnd.to_string(),
            _ => String::new(),
        };

        let params = EnvParams {
            user: &uc.pw,
            runas: runas_pw,
            mode: *mode,
            command: &command,
            ccname: uc.ccname.as_deref(),
            secure_path: def.secure_path.as_deref(),
        };
        *env_out = Some(rebuild_env(env, def, &params));
    }

    /**
     * Historical wrinkle: a root-invoked request that still names the
     * original user through SUDO_USER is re-attributed to that user
     * late, so logs show who really sat at the keyboard. Confusing
     * when root itself holds no rule, but relied upon in the field.
     */
    fn rebind_prev_user(&mut self) {
        if !self.mode.intersects(ModeFlags::RUN | ModeFlags::EDIT) {
            return;
        }

        let prev = {
            let uc = self.uc.as_ref().expect("initialized");
            if !uc.uid.is_root() {
                return;
            }
            match uc.prev_user.as_deref() {
                Some(prev) if prev != "root" => prev.to_string(),
                _ => return,
            }
        };

        if let Ok(Some(pw)) = self.db.user_by_name(&prev) {
            let uc = self.uc.as_mut().expect("initialized");
            uc.name = pw.name.clone();
            uc.pw = pw;
        }
    }

    fn prepare_editor(&mut self) -> Result<(), Error> {
        let files: Vec<String> = self.new_argv.iter().skip(1).cloned().collect();
        let env_candidates = {
            let candidates = ["SUDO_EDITOR", "VISUAL", "EDITOR"];
            candidates
                .iter()
                .filter_map(|name| self.env.get(name).map(str::to_string))
                .collect::<Vec<String>>()
        };

        match find_editor(
            &files,
            &env_candidates,
            &self.def.editor,
            self.def.env_editor,
        ) {
            Ok((cmnd, argv)) => {
                self.rc.cmnd = Some(cmnd);
                self.new_argv = argv;
                Ok(())
            }
            Err(err) => {
                if self.def.env_editor && !env_candidates.is_empty() {
                    self.deny(&format!(
                        "invalid user-specified editor: {}",
                        env_candidates[0]
                    ));
                }
                Err(err)
            }
        }
    }

    fn format_iolog_path(&mut self) -> Result<Option<String>, Error> {
        if !self.def.log_input && !self.def.log_output {
            return Ok(None);
        }

        let expanded = {
            let _locale = LocaleGuard::enter(&self.def.sudoers_locale);
            let Engine { db, uc, rc, def, iolog_seq, .. } = self;
            let uc = uc.as_ref().expect("initialized");
            let runas_pw = rc.pw.as_ref().unwrap_or(&uc.pw);

            let group = db
                .group_by_gid(uc.gid)
                .ok()
                .flatten()
                .map(|g| g.name.clone())
                .unwrap_or_else(|| uc.gid.as_raw().to_string());
            let runas_group = rc
                .gr
                .as_ref()
                .map(|g| g.name.clone())
                .unwrap_or_else(|| runas_pw.gid.as_raw().to_string());

            let esc = IologEscapes {
                user: &uc.name,
                group: &group,
                runas_user: &runas_pw.name,
                runas_group: &runas_group,
                hostname: &uc.shost,
                command: &uc.cmnd_base,
                seq: iolog_seq.as_deref(),
            };
            expand_iolog_path(&def.iolog_dir, &def.iolog_file, &esc, chrono::Local::now())
        };

        match expanded {
            Some(path) => Ok(Some(path)),
            None if self.def.ignore_iolog_errors => {
                // Logging quietly turns off rather than blocking the run.
                self.def.log_input = false;
                self.def.log_output = false;
                Ok(None)
            }
            None => Err(ResourceError::EnvBuild(
                "unable to expand the session log path".to_string(),
            )
            .into()),
        }
    }

    fn create_admin_flag(&mut self) {
        if self.mode.contains(ModeFlags::POLICY_INTERCEPTED) {
            return;
        }
        let Some(template) = self.def.admin_flag.clone() else {
            return;
        };

        let uc = self.uc.as_ref().expect("initialized");
        let path = match template.strip_prefix("~/") {
            Some(rest) => format!("{}/{}", uc.pw.home, rest),
            None => template,
        };

        if let Err(err) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            debug!(%err, path = path.as_str(), "admin flag file not written");
        }
    }

    fn store_result(
        &mut self,
        umask: u32,
        iolog_path: Option<String>,
    ) -> Result<ExecPlan, Error> {
        let Engine { db, uc, rc, def, match_info, env_out, iolog_seq: _, .. } = self;
        let uc = uc.as_ref().expect("initialized");
        let runas_pw = rc.pw.as_ref().unwrap_or(&uc.pw);

        let runas_groups = if def.preserve_groups {
            uc.gids.iter().map(|g| g.as_raw()).collect()
        } else {
            db.group_list(runas_pw)
                .map(|gids| gids.iter().map(|g| g.as_raw()).collect())
                .unwrap_or_else(|_| vec![runas_pw.gid.as_raw()])
        };

        let tags = match_info.as_ref().map(|m| m.tags).unwrap_or_default();
        let timeout = uc
            .timeout
            .or_else(|| match_info.as_ref().and_then(|m| m.timeout))
            .or(if def.command_timeout > 0 {
                Some(def.command_timeout)
            } else {
                None
            });

        let info = CommandInfo {
            command: rc.cmnd.clone().unwrap_or_default(),
            runas_uid: runas_pw.uid.as_raw(),
            runas_gid: rc
                .gr
                .as_ref()
                .map(|gr| gr.gid.as_raw())
                .unwrap_or_else(|| runas_pw.gid.as_raw()),
            runas_groups,
            umask,
            iolog_path,
            log_input: def.log_input,
            log_output: def.log_output,
            chroot: rc
                .chroot
                .clone()
                .or_else(|| match_info.as_ref().and_then(|m| m.runchroot.clone())),
            cwd: rc
                .cwd
                .clone()
                .or_else(|| match_info.as_ref().and_then(|m| m.runcwd.clone())),
            timeout,
            closefrom: Some(def.closefrom),
            use_pty: def.use_pty,
            set_utmp: def.set_utmp,
            intercept: def.intercept || tags.intercept == Some(true),
            login_class: rc.class.clone(),
            selinux_role: rc
                .role
                .clone()
                .or_else(|| match_info.as_ref().and_then(|m| m.role.clone())),
            selinux_type: rc
                .selinux_type
                .clone()
                .or_else(|| match_info.as_ref().and_then(|m| m.selinux_type.clone())),
            apparmor_profile: rc
                .apparmor_profile
                .clone()
                .or_else(|| match_info.as_ref().and_then(|m| m.apparmor_profile.clone())),
            source: uc.source.clone(),
        };

        Ok(ExecPlan {
            argv: self.new_argv.clone(),
            envp: env_out.clone().map(Environment::into_vec).unwrap_or_default(),
            info,
        })
    }

    fn maybe_reinit(&mut self) -> Result<(), Error> {
        if self.need_reinit {
            if self.mode.contains(ModeFlags::RUN) && self.def.intercept {
                self.mode |= ModeFlags::POLICY_INTERCEPTED;
            }
            if self.mode.contains(ModeFlags::POLICY_INTERCEPTED) {
                self.mode &= ModeFlags::intercept_mask();
            }
            self.reinit_defaults()?;
        }
        self.need_reinit = true;
        Ok(())
    }

    /**
     * Reset the settings store for a repeat request. Everything is
     * re-applied with logging off; the first pass already reported
     * whatever was wrong.
     */
    fn reinit_defaults(&mut self) -> Result<(), Error> {
        self.def.init();
        self.apply_defaults_layer(true, SetScope::non_cmnd(), false)?;
        self.apply_defaults_layer(false, SetScope::non_cmnd(), true)?;
        self.handle_changed_defaults()?;

        if self.mode.contains(ModeFlags::POLICY_INTERCEPTED) {
            self.def.admin_flag = None;
        }
        Ok(())
    }

    fn open_sources(&mut self) -> Result<(), Error> {
        let _locale = LocaleGuard::enter(&self.def.sudoers_locale);
        self.sources.open_all()?;
        self.apply_defaults_layer(false, SetScope::non_cmnd(), false)?;
        Ok(())
    }

    /**
     * Apply either the front-end layer (`initial`) or every source's
     * settings entries under the given scope mask.
     */
    fn apply_defaults_layer(
        &mut self,
        initial: bool,
        scope: SetScope,
        quiet: bool,
    ) -> Result<(), Error> {
        let now = chrono::Local::now().timestamp();
        let runas_default = self.def.runas_default.clone();
        let Engine { db, sources, uc, rc, def, initial_defaults, mode, .. } = self;

        let req_storage;
        let req = match uc.as_ref() {
            Some(uc) => {
                let runas_pw = rc.pw.as_ref().unwrap_or(&uc.pw);
                req_storage = LookupRequest {
                    db,
                    user: &uc.pw,
                    user_gids: &uc.gids,
                    host: &uc.host,
                    shost: &uc.shost,
                    runas_user: runas_pw,
                    runas_group: rc.gr.as_deref(),
                    runas_default: &runas_default,
                    cmnd_path: if mode.contains(ModeFlags::CHECK) {
                        uc.cmnd_list.as_deref()
                    } else {
                        uc.cmnd.as_deref()
                    },
                    cmnd_args: uc.cmnd_args.as_deref(),
                    now,
                };
                Some(req_storage)
            }
            None => None,
        };

        let matcher = |binding: &Binding| match (&req, binding) {
            (_, Binding::Generic) => true,
            (Some(req), binding) => binding_matches(req, binding),
            (None, _) => false,
        };

        if initial {
            def.apply(initial_defaults, scope, quiet, matcher);
        } else {
            for source in sources.iter() {
                match source.get_defaults() {
                    Ok(entries) => {
                        def.apply(entries, scope, quiet, &matcher);
                    }
                    Err(err) => {
                        if !quiet {
                            warn!(source = source.source(), %err, "unable to get settings entries");
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /**
     * React to settings that were changed by the last layer.
     */
    fn handle_changed_defaults(&mut self) -> Result<(), Error> {
        for name in self.def.take_changed() {
            if name == "runas_default"
                && self.rc.user_req.is_none()
                && self.rc.group_req.is_none()
            {
                // Only re-resolve when the requester named no target.
                let fallback_gid = self.uc.as_ref().map(|uc| uc.gid).unwrap_or(Gid::from_raw(0));
                let spec = self.def.runas_default.clone();
                let found = self.db.resolve_runas_user(&spec, fallback_gid)?;
                self.unknown_runas_uid = found.unknown_id;
                self.rc.pw = Some(found.entry);
            }
        }
        Ok(())
    }

    fn resolve_runas(&mut self) -> Result<(), Error> {
        self.unknown_runas_uid = false;
        self.unknown_runas_gid = false;

        let uc_name = self.uc.as_ref().map(|uc| uc.name.clone()).unwrap_or_default();
        let uc_gid = self.uc.as_ref().map(|uc| uc.gid).unwrap_or(Gid::from_raw(0));

        if let Some(group_spec) = self.rc.group_req.clone() {
            let group = self.db.resolve_runas_group(&group_spec)?;
            self.unknown_runas_gid = group.unknown_id;
            self.rc.gr = Some(group.entry);

            // A group without a user runs as the invoking user.
            let user_spec = self.rc.user_req.clone().unwrap_or(uc_name);
            let user = self.db.resolve_runas_user(&user_spec, uc_gid)?;
            self.unknown_runas_uid = user.unknown_id;
            self.rc.pw = Some(user.entry);
        } else {
            let user_spec = self
                .rc
                .user_req
                .clone()
                .unwrap_or_else(|| self.def.runas_default.clone());
            let user = self.db.resolve_runas_user(&user_spec, uc_gid)?;
            self.unknown_runas_uid = user.unknown_id;
            self.rc.pw = Some(user.entry);
        }

        Ok(())
    }

    fn set_loginclass(&mut self) -> Result<(), Error> {
        if !self.def.use_loginclass {
            return Ok(());
        }

        let Some(class) = self.rc.class.clone() else {
            return Ok(());
        };
        if class == "-" {
            return Ok(());
        }

        {
            let uc = self.uc.as_ref().expect("initialized");
            let target_root = self
                .rc
                .pw
                .as_ref()
                .map(|pw| pw.uid.is_root())
                .unwrap_or(false);
            if !uc.uid.is_root() && !target_root {
                return Err(UsageError::Other(format!(
                    "only root can use a login class ({class})"
                ))
                .into());
            }
        }

        if !self.classes.valid(&class) {
            warn!(class = class.as_str(), "unknown login class");
            return Err(UsageError::Other(format!("unknown login class {class}")).into());
        }

        Ok(())
    }

    fn build_user_context(
        &mut self,
        settings: &FrontendSettings,
        info: &crate::modules::wire::FrontendUserInfo,
        envp: &[String],
    ) -> Result<(), Error> {
        let pw = match self.db.user_by_name(&info.user).map_err(|err| ResourceError::Io {
            path: "user database".to_string(),
            err,
        })? {
            Some(pw) => pw,
            None => {
                // Credential services may be gone during shutdown; a
                // cache invalidation still deserves a proper message.
                warn!(user = info.user.as_str(), "unknown user");
                return Err(InputError::UnknownUser(info.user.clone()).into());
            }
        };

        let gids: Vec<Gid> = if info.groups.is_empty() {
            self.db
                .group_list(&pw)
                .map(|g| g.as_ref().clone())
                .unwrap_or_else(|_| vec![pw.gid])
        } else {
            info.groups.iter().map(|g| Gid::from_raw(*g)).collect()
        };

        let host = info
            .host
            .clone()
            .or_else(|| {
                nix::unistd::gethostname()
                    .ok()
                    .map(|h| h.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "localhost".to_string());
        let shost = host.split('.').next().unwrap_or(&host).to_string();

        let (tty, ttypath) = match info.tty.clone() {
            Some(path) if path.starts_with("/dev/") => {
                let short = path.trim_start_matches("/dev/").to_string();
                (Some(short), Some(path))
            }
            Some(short) => (Some(short), None),
            None => (None, None),
        };

        let mut prompt = settings.prompt.clone();
        let mut ccname = None;
        let mut path_var = None;
        let mut prev_user = None;
        for entry in envp {
            if let Some(value) = entry.strip_prefix("KRB5CCNAME=") {
                ccname = Some(value.to_string());
            } else if let Some(value) = entry.strip_prefix("PATH=") {
                path_var = Some(value.to_string());
            } else if let Some(value) = entry.strip_prefix("SUDO_PROMPT=") {
                // A prompt in the request settings wins.
                if prompt.is_none() {
                    prompt = Some(value.to_string());
                }
            } else if let Some(value) = entry.strip_prefix("SUDO_USER=") {
                prev_user = Some(value.to_string());
            }
        }

        self.uc = Some(UserContext {
            name: pw.name.clone(),
            uid: Uid::from_raw(info.uid),
            gid: Gid::from_raw(info.gid),
            gids,
            pw,
            tty,
            ttypath,
            tcpgid: info.tcpgid,
            cwd: info.cwd.clone(),
            host,
            shost,
            path: path_var,
            prompt,
            ccname,
            prev_user,
            closefrom: settings.closefrom,
            timeout: settings.timeout,
            umask: info.umask,
            env_vars: Vec::new(),
            cmnd: None,
            cmnd_args: None,
            cmnd_base: String::new(),
            cmnd_dir: None,
            cmnd_stat: None,
            cmnd_list: None,
            source: None,
        });

        Ok(())
    }

    fn shell_ok(&self, pw: &User) -> bool {
        match &self.valid_shells {
            None => true,
            Some(list) => list.iter().any(|shell| shell == &pw.shell),
        }
    }

    fn deny(&mut self, reason: &str) {
        let Engine { uc, audit, new_argv, .. } = self;
        let name = uc.as_ref().map(|uc| uc.name.as_str()).unwrap_or("unknown");
        let event = AuditEvent::failure(name, new_argv, reason);
        audit.audit_failure(&event);
        warn!(user = name, reason, "request refused");
    }

    fn root_creds(&self) -> Creds {
        let entry = self.perms.entry_creds();
        Creds::new(
            entry.ruid,
            Uid::from_raw(0),
            entry.rgid,
            entry.egid,
            entry.groups.clone(),
        )
    }

    fn user_creds(&self) -> Creds {
        match self.uc.as_ref() {
            Some(uc) => Creds::new(uc.uid, uc.uid, uc.gid, uc.gid, uc.gids.clone()),
            None => self.perms.entry_creds().clone(),
        }
    }

    fn sudoers_creds(&self) -> Creds {
        let entry = self.perms.entry_creds();
        Creds::new(
            entry.ruid,
            Uid::from_raw(self.settings.sudoers_uid.unwrap_or(0)),
            entry.rgid,
            Gid::from_raw(self.settings.sudoers_gid.unwrap_or(0)),
            entry.groups.clone(),
        )
    }

    fn ensure_init(&self) -> Result<(), Error> {
        if self.uc.is_none() {
            return Err(UsageError::Other("request before initialization".to_string()).into());
        }
        Ok(())
    }
}

/**
 * Turn the front-end's raw `name`, `!name` and `name=value` overrides
 * into settings entries.
 */
fn frontend_defaults(raw: &[String]) -> Vec<DefaultsEntry> {
    let origin = Origin::new("front-end", 0, 0);
    let mut out = Vec::new();

    for item in raw {
        let entry = if let Some(name) = item.strip_prefix('!') {
            DefaultsEntry {
                binding: Binding::Generic,
                name: name.to_string(),
                op: DefaultsOp::Disable,
                value: DefaultsValue::None,
                origin: origin.clone(),
            }
        } else if let Some((name, value)) = item.split_once('=') {
            DefaultsEntry {
                binding: Binding::Generic,
                name: name.to_string(),
                op: DefaultsOp::Assign,
                value: DefaultsValue::Str(value.to_string()),
                origin: origin.clone(),
            }
        } else {
            DefaultsEntry {
                binding: Binding::Generic,
                name: item.clone(),
                op: DefaultsOp::Enable,
                value: DefaultsValue::None,
                origin: origin.clone(),
            }
        };
        out.push(entry);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontend_defaults_parse_all_three_shapes() {
        let entries = frontend_defaults(&[
            "requiretty".to_string(),
            "!env_reset".to_string(),
            "passwd_tries=5".to_string(),
        ]);

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].op, DefaultsOp::Enable);
        assert_eq!(entries[1].op, DefaultsOp::Disable);
        assert_eq!(entries[1].name, "env_reset");
        assert_eq!(entries[2].op, DefaultsOp::Assign);
        assert_eq!(entries[2].value, DefaultsValue::Str("5".to_string()));
    }
}
