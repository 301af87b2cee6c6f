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
 * The authentication gate.
 *
 * Deciding whether a password is required is policy; collecting and
 * verifying one is not. The gate owns the decision and the retry loop,
 * and delegates the actual conversation to an `Authenticator`
 * collaborator (PAM, BSD auth, a test script). Recent successful
 * authentication is consulted through a `TimestampStore` collaborator
 * so the user is not re-prompted inside the grace window.
 *
 * Also here: the tty requirement, and the allow-lists for requested
 * chroot and working-directory overrides.
 */

use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::modules::defaults::Defaults;
use crate::modules::error::{AuthError, Error};
use crate::modules::lookup::ValidationFlags;
use crate::modules::shared::{ModeFlags, PATH_TTY};
use crate::modules::user::User;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated,
    Rejected,
}

/**
 * The external authentication backend.
 */
pub trait Authenticator {
    fn verify(&mut self, user: &User, prompt: &str, mode: ModeFlags)
        -> Result<AuthOutcome, AuthError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketStatus {
    Valid,
    Stale,
    Missing,
}

/**
 * The persisted authentication-cache collaborator.
 */
pub trait TimestampStore {
    fn status(&mut self, user: &User, tty: Option<&str>) -> TicketStatus;
    fn update(&mut self, user: &User, tty: Option<&str>);
    fn invalidate(&mut self, user: &User);
}

/**
 * A store that never remembers anything.
 */
pub struct NullTimestamp;

impl TimestampStore for NullTimestamp {
    fn status(&mut self, _user: &User, _tty: Option<&str>) -> TicketStatus {
        TicketStatus::Missing
    }

    fn update(&mut self, _user: &User, _tty: Option<&str>) {}

    fn invalidate(&mut self, _user: &User) {}
}

/**
 * What the gate decided.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Pass,
    /**
     * `prompted` tells the caller whether the user ever saw a prompt;
     * a denial message is only shown when they did not.
     */
    Denied { prompted: bool },
}

/**
 * Decide whether authentication is needed and run it if so.
 */
#[allow(clippy::too_many_arguments)]
pub fn check_user(
    validated: ValidationFlags,
    mode: ModeFlags,
    user: &User,
    runas_user: &User,
    runas_group_requested: bool,
    tty: Option<&str>,
    prompt_possible: bool,
    prompt: &str,
    def: &Defaults,
    auth: &mut dyn Authenticator,
    ts: &mut dyn TimestampStore,
) -> Result<AuthDecision, Error> {
    // Root and self-to-self requests carry their own proof of identity.
    let exempt = user.is_root()
        || (user.uid == runas_user.uid && !runas_group_requested);

    if exempt || !def.authenticate || validated.contains(ValidationFlags::NOPASSWD) {
        debug!(user = user.name.as_str(), "authentication not required");
        return Ok(AuthDecision::Pass);
    }

    if !mode.contains(ModeFlags::IGNORE_TICKET) && ts.status(user, tty) == TicketStatus::Valid {
        debug!(user = user.name.as_str(), "authentication cached");
        ts.update(user, tty);
        return Ok(AuthDecision::Pass);
    }

    if mode.contains(ModeFlags::NONINTERACTIVE) {
        return Err(AuthError::PasswordRequired.into());
    }

    if !prompt_possible {
        return Err(AuthError::NoTtyNoAskpass.into());
    }

    if def.passwd_tries == 0 {
        return Ok(AuthDecision::Denied { prompted: false });
    }

    for attempt in 1..=def.passwd_tries {
        match auth.verify(user, prompt, mode)? {
            AuthOutcome::Authenticated => {
                ts.update(user, tty);
                return Ok(AuthDecision::Pass);
            }
            AuthOutcome::Rejected => {
                if attempt < def.passwd_tries {
                    warn!(user = user.name.as_str(), attempt, "Sorry, try again.");
                }
            }
        }
    }

    warn!(
        user = user.name.as_str(),
        tries = def.passwd_tries,
        "incorrect password attempts"
    );
    Ok(AuthDecision::Denied { prompted: true })
}

/**
 * Whether a controlling terminal exists. The context fields from the
 * front-end are trusted first; with neither a tty process group nor a
 * tty path the tie is broken by opening the controlling tty directly.
 */
pub fn tty_present(tcpgid: Option<i32>, ttypath: Option<&str>) -> bool {
    if tcpgid.unwrap_or(0) == 0 && ttypath.is_none() {
        // No job control or terminal, check /dev/tty.
        return match nix::fcntl::open(
            PATH_TTY,
            nix::fcntl::OFlag::O_RDWR,
            nix::sys::stat::Mode::empty(),
        ) {
            Ok(fd) => {
                drop(fd);
                true
            }
            Err(_) => false,
        };
    }
    true
}

/**
 * Whether an interactive prompt could reach the user at all: stdin is
 * a terminal or the front-end advertised an askpass helper.
 */
pub fn can_prompt(askpass: bool) -> bool {
    askpass || atty::is(atty::Stream::Stdin)
}

/**
 * A requested chroot is only honored when the matched rule or the
 * settings name it, or carry the wildcard.
 */
pub fn runchroot_allowed(requested: Option<&str>, rule: Option<&str>, setting: Option<&str>) -> bool {
    let Some(requested) = requested else {
        return true;
    };

    match rule.or(setting) {
        Some(allowed) => allowed == "*" || allowed == requested,
        None => false,
    }
}

/**
 * Same shape for a requested working directory.
 */
pub fn runcwd_allowed(requested: Option<&str>, rule: Option<&str>, setting: Option<&str>) -> bool {
    let Some(requested) = requested else {
        return true;
    };

    match rule.or(setting) {
        Some(allowed) => allowed == "*" || allowed == requested,
        None => false,
    }
}

/**
 * Expand prompt escapes: `%u` invoking user, `%U` target user, `%h`
 * short host name, `%H` full host name, `%p` the user whose password
 * is being asked for, `%%` a literal percent.
 */
pub fn expand_prompt(
    prompt: &str,
    user: &str,
    runas_user: &str,
    host: &str,
    shost: &str,
) -> String {
    let mut out = String::with_capacity(prompt.len());
    let mut chars = prompt.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('u') => out.push_str(user),
            Some('U') => out.push_str(runas_user),
            Some('h') => out.push_str(shost),
            Some('H') => out.push_str(host),
            Some('p') => out.push_str(user),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }

    out
}

/**
 * A minimal built-in backend comparing against a configured secret.
 * Meant for test rigs and embedders without a system authenticator;
 * the secret is wiped when the value is dropped.
 */
pub struct StaticPasswordAuth {
    secret: String,
    supplied: Option<String>,
}

impl StaticPasswordAuth {
    pub fn new(secret: &str) -> StaticPasswordAuth {
        StaticPasswordAuth {
            secret: secret.to_string(),
            supplied: None,
        }
    }

    /**
     * Stage the credential the next `verify` call will test.
     */
    pub fn supply(&mut self, password: &str) {
        if let Some(mut old) = self.supplied.take() {
            old.zeroize();
        }
        self.supplied = Some(password.to_string());
    }
}

impl Authenticator for StaticPasswordAuth {
    fn verify(
        &mut self,
        _user: &User,
        _prompt: &str,
        _mode: ModeFlags,
    ) -> Result<AuthOutcome, AuthError> {
        match self.supplied.take() {
            Some(mut attempt) => {
                let ok = constant_time_eq(self.secret.as_bytes(), attempt.as_bytes());
                attempt.zeroize();
                if ok {
                    Ok(AuthOutcome::Authenticated)
                } else {
                    Ok(AuthOutcome::Rejected)
                }
            }
            None => Err(AuthError::EmptyPassword),
        }
    }
}

impl Drop for StaticPasswordAuth {
    fn drop(&mut self) {
        self.secret.zeroize();
        if let Some(mut supplied) = self.supplied.take() {
            supplied.zeroize();
        }
    }
}

/*
 * Compare without early exit. Every byte of the known value is always
 * visited so the timing reveals nothing about the mismatch position.
 */
fn constant_time_eq(known: &[u8], secret: &[u8]) -> bool {
    let mut result = known.len() ^ secret.len();

    for (i, b) in known.iter().enumerate() {
        result |= if i >= secret.len() {
            usize::from(b ^ !b)
        } else {
            usize::from(b ^ secret[i])
        };
    }

    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::lookup::ValidationFlags;
    use nix::unistd::{Gid, Uid};

    fn user(name: &str, uid: u32) -> User {
        User {
            name: name.to_string(),
            uid: Uid::from_raw(uid),
            gid: Gid::from_raw(uid),
            home: format!("/home/{name}"),
            shell: "/bin/bash".to_string(),
        }
    }

    struct Scripted {
        outcomes: Vec<Result<AuthOutcome, AuthError>>,
        calls: usize,
    }

    impl Authenticator for Scripted {
        fn verify(
            &mut self,
            _user: &User,
            _prompt: &str,
            _mode: ModeFlags,
        ) -> Result<AuthOutcome, AuthError> {
            let out = self.outcomes.remove(0);
            self.calls += 1;
            out
        }
    }

    fn defaults() -> Defaults {
        Defaults::new()
    }

    #[test]
    fn root_is_exempt() {
        let root = user("root", 0);
        let target = user("operator", 12);
        let mut auth = Scripted { outcomes: vec![], calls: 0 };
        let mut ts = NullTimestamp;

        let out = check_user(
            ValidationFlags::SUCCESS,
            ModeFlags::RUN,
            &root,
            &target,
            false,
            None,
            true,
            "Password: ",
            &defaults(),
            &mut auth,
            &mut ts,
        )
        .unwrap();

        assert_eq!(out, AuthDecision::Pass);
        assert_eq!(auth.calls, 0);
    }

    #[test]
    fn nopasswd_skips_the_backend() {
        let alice = user("alice", 1000);
        let root = user("root", 0);
        let mut auth = Scripted { outcomes: vec![], calls: 0 };
        let mut ts = NullTimestamp;

        let out = check_user(
            ValidationFlags::SUCCESS | ValidationFlags::NOPASSWD,
            ModeFlags::RUN,
            &alice,
            &root,
            false,
            None,
            true,
            "Password: ",
            &defaults(),
            &mut auth,
            &mut ts,
        )
        .unwrap();

        assert_eq!(out, AuthDecision::Pass);
        assert_eq!(auth.calls, 0);
    }

    #[test]
    fn retries_until_tries_are_exhausted() {
        let alice = user("alice", 1000);
        let root = user("root", 0);
        let mut auth = Scripted {
            outcomes: vec![
                Ok(AuthOutcome::Rejected),
                Ok(AuthOutcome::Rejected),
                Ok(AuthOutcome::Rejected),
            ],
            calls: 0,
        };
        let mut ts = NullTimestamp;

        let out = check_user(
            ValidationFlags::SUCCESS,
            ModeFlags::RUN,
            &alice,
            &root,
            false,
            None,
            true,
            "Password: ",
            &defaults(),
            &mut auth,
            &mut ts,
        )
        .unwrap();

        assert_eq!(out, AuthDecision::Denied { prompted: true });
        assert_eq!(auth.calls, 3);
    }

    #[test]
    fn second_attempt_can_succeed() {
        let alice = user("alice", 1000);
        let root = user("root", 0);
        let mut auth = Scripted {
            outcomes: vec![Ok(AuthOutcome::Rejected), Ok(AuthOutcome::Authenticated)],
            calls: 0,
        };

        struct Recording {
            updated: bool,
        }
        impl TimestampStore for Recording {
            fn status(&mut self, _u: &User, _t: Option<&str>) -> TicketStatus {
                TicketStatus::Missing
            }
            fn update(&mut self, _u: &User, _t: Option<&str>) {
                self.updated = true;
            }
            fn invalidate(&mut self, _u: &User) {}
        }
        let mut ts = Recording { updated: false };

        let out = check_user(
            ValidationFlags::SUCCESS,
            ModeFlags::RUN,
            &alice,
            &root,
            false,
            None,
            true,
            "Password: ",
            &defaults(),
            &mut auth,
            &mut ts,
        )
        .unwrap();

        assert_eq!(out, AuthDecision::Pass);
        assert!(ts.updated);
    }

    #[test]
    fn valid_ticket_skips_the_prompt() {
        let alice = user("alice", 1000);
        let root = user("root", 0);
        let mut auth = Scripted { outcomes: vec![], calls: 0 };

        struct Cached;
        impl TimestampStore for Cached {
            fn status(&mut self, _u: &User, _t: Option<&str>) -> TicketStatus {
                TicketStatus::Valid
            }
            fn update(&mut self, _u: &User, _t: Option<&str>) {}
            fn invalidate(&mut self, _u: &User) {}
        }
        let mut ts = Cached;

        let out = check_user(
            ValidationFlags::SUCCESS,
            ModeFlags::RUN,
            &alice,
            &root,
            false,
            Some("pts/3"),
            true,
            "Password: ",
            &defaults(),
            &mut auth,
            &mut ts,
        )
        .unwrap();

        assert_eq!(out, AuthDecision::Pass);
        assert_eq!(auth.calls, 0);
    }

    #[test]
    fn noninteractive_with_missing_ticket_errors() {
        let alice = user("alice", 1000);
        let root = user("root", 0);
        let mut auth = Scripted { outcomes: vec![], calls: 0 };
        let mut ts = NullTimestamp;

        let err = check_user(
            ValidationFlags::SUCCESS,
            ModeFlags::RUN | ModeFlags::NONINTERACTIVE,
            &alice,
            &root,
            false,
            None,
            true,
            "Password: ",
            &defaults(),
            &mut auth,
            &mut ts,
        )
        .unwrap_err();

        assert!(matches!(err, Error::Auth(AuthError::PasswordRequired)));
    }

    #[test]
    fn backend_errors_propagate() {
        let alice = user("alice", 1000);
        let root = user("root", 0);
        let mut auth = Scripted {
            outcomes: vec![Err(AuthError::Timeout)],
            calls: 0,
        };
        let mut ts = NullTimestamp;

        let err = check_user(
            ValidationFlags::SUCCESS,
            ModeFlags::RUN,
            &alice,
            &root,
            false,
            None,
            true,
            "Password: ",
            &defaults(),
            &mut auth,
            &mut ts,
        )
        .unwrap_err();

        assert!(matches!(err, Error::Auth(AuthError::Timeout)));
    }

    #[test]
    fn chroot_and_cwd_allowances() {
        assert!(runchroot_allowed(None, None, None));
        assert!(!runchroot_allowed(Some("/jail"), None, None));
        assert!(runchroot_allowed(Some("/jail"), Some("/jail"), None));
        assert!(runchroot_allowed(Some("/jail"), None, Some("*")));
        // The rule constraint shadows the settings value.
        assert!(!runchroot_allowed(Some("/jail"), Some("/other"), Some("*")));

        assert!(runcwd_allowed(Some("/srv"), None, Some("/srv")));
        assert!(!runcwd_allowed(Some("/srv"), None, Some("/tmp")));
    }

    #[test]
    fn prompt_escapes() {
        let out = expand_prompt("[%u@%h] %U %% %p: ", "alice", "root", "box.example.com", "box");
        assert_eq!(out, "[alice@box] root % alice: ");
    }

    #[test]
    fn static_password_auth_compares_and_wipes() {
        let alice = user("alice", 1000);
        let mut auth = StaticPasswordAuth::new("hunter2");

        auth.supply("wrong");
        assert_eq!(
            auth.verify(&alice, "Password: ", ModeFlags::RUN).unwrap(),
            AuthOutcome::Rejected
        );

        auth.supply("hunter2");
        assert_eq!(
            auth.verify(&alice, "Password: ", ModeFlags::RUN).unwrap(),
            AuthOutcome::Authenticated
        );

        // Nothing staged: the read failed, not the comparison.
        assert!(matches!(
            auth.verify(&alice, "Password: ", ModeFlags::RUN),
            Err(AuthError::EmptyPassword)
        ));
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
