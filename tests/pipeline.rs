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
 * End-to-end pipeline checks: a full engine wired with in-memory
 * collaborators, driven through the same bundles a front-end sends.
 */

use std::cell::RefCell;
use std::rc::Rc;

use pretty_assertions::assert_eq;

use runas_policy::modules::auth::{AuthOutcome, Authenticator, TicketStatus, TimestampStore};
use runas_policy::modules::error::AuthError;
use runas_policy::modules::perms::testing::MockCreds;
use runas_policy::modules::perms::Creds;
use runas_policy::modules::user::testing::FakeNss;
use runas_policy::modules::user::User;
use runas_policy::{
    AuditEvent, AuditSink, BufferingAudit, CmndSpec, Decision, Engine, EngineConfig, Member,
    MemberKind, ModeFlags, NullLoginClass, Origin, ParseTree, Privilege, StaticSource, Tags,
    UserSpec,
};

struct SharedAudit(Rc<RefCell<BufferingAudit>>);

impl AuditSink for SharedAudit {
    fn audit_success(&mut self, event: &AuditEvent<'_>) {
        self.0.borrow_mut().audit_success(event);
    }

    fn audit_failure(&mut self, event: &AuditEvent<'_>) {
        self.0.borrow_mut().audit_failure(event);
    }
}

struct AlwaysYes;

impl Authenticator for AlwaysYes {
    fn verify(
        &mut self,
        _user: &User,
        _prompt: &str,
        _mode: ModeFlags,
    ) -> Result<AuthOutcome, AuthError> {
        Ok(AuthOutcome::Authenticated)
    }
}

#[derive(Default)]
struct SharedTs {
    updates: Rc<RefCell<usize>>,
}

impl TimestampStore for SharedTs {
    fn status(&mut self, _user: &User, _tty: Option<&str>) -> TicketStatus {
        TicketStatus::Missing
    }

    fn update(&mut self, _user: &User, _tty: Option<&str>) {
        *self.updates.borrow_mut() += 1;
    }

    fn invalidate(&mut self, _user: &User) {}
}

fn nss() -> FakeNss {
    FakeNss::default()
        .with_user("alice", 1000, 1000)
        .with_user("root", 0, 0)
        .with_group("users", 1000, &[])
        .with_group("root", 0, &[])
        .with_group("wheel", 10, &["alice"])
        .with_membership("alice", &[10])
}

fn allow_all_spec(tags: Tags) -> UserSpec {
    let mut cs = CmndSpec::new(Member::of(MemberKind::All));
    cs.tags = tags;
    UserSpec {
        users: vec![Member::of(MemberKind::UserName("alice".to_string()))],
        privileges: vec![Privilege {
            hosts: vec![Member::of(MemberKind::All)],
            cmndspecs: vec![cs],
        }],
        origin: Origin::new("/etc/rules", 3, 1),
    }
}

struct Rig {
    engine: Engine,
    audit: Rc<RefCell<BufferingAudit>>,
    creds_log: Rc<RefCell<Vec<Creds>>>,
    ts_updates: Rc<RefCell<usize>>,
}

fn rig(tree: ParseTree) -> Rig {
    let audit = Rc::new(RefCell::new(BufferingAudit::default()));

    // The process enters the way a setuid binary does: real uid is the
    // invoking user, effective uid is root.
    let entry = Creds::new(
        nix::unistd::Uid::from_raw(1000),
        nix::unistd::Uid::from_raw(0),
        nix::unistd::Gid::from_raw(1000),
        nix::unistd::Gid::from_raw(0),
        vec![nix::unistd::Gid::from_raw(1000)],
    );
    let mock = MockCreds::new(entry);
    let creds_log = mock.log.clone();

    let ts = SharedTs::default();
    let ts_updates = ts.updates.clone();

    let engine = Engine::new(EngineConfig {
        nss: Box::new(nss()),
        cred_ops: Box::new(mock),
        sources: vec![Box::new(StaticSource::new("/etc/rules", tree))],
        authenticator: Box::new(AlwaysYes),
        timestamps: Box::new(ts),
        audit: Box::new(SharedAudit(audit.clone())),
        login_classes: Box::new(NullLoginClass),
        valid_shells: None,
        iolog_seq: None,
    })
    .unwrap();

    Rig {
        engine,
        audit,
        creds_log,
        ts_updates,
    }
}

fn user_info(user: &str, uid: u32) -> Vec<String> {
    vec![
        format!("user={user}"),
        format!("uid={uid}"),
        format!("gid={uid}"),
        format!("groups={uid}"),
        "host=buildhost.example.com".to_string(),
        "tty=/dev/pts/1".to_string(),
        "cwd=/home/alice".to_string(),
        "umask=022".to_string(),
    ]
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn allowed_command_produces_a_full_plan() {
    let tree = ParseTree {
        defaults: Vec::new(),
        userspecs: vec![allow_all_spec(Tags::default())],
    };
    let mut rig = rig(tree);

    rig.engine
        .init(
            &strings(&[]),
            &user_info("alice", 1000),
            &strings(&["PATH=/usr/bin:/bin", "TERM=xterm"]),
        )
        .unwrap();

    let decision = rig
        .engine
        .check(&strings(&["/bin/ls", "-l"]), &[])
        .unwrap();

    let Decision::Allow(plan) = decision else {
        panic!("expected an allow decision");
    };
    assert_eq!(plan.argv, vec!["/bin/ls", "-l"]);
    assert_eq!(plan.info.command, "/bin/ls");
    assert_eq!(plan.info.runas_uid, 0);
    assert_eq!(plan.info.source.as_deref(), Some("/etc/rules:3:1"));
    assert_eq!(plan.info.umask, 0o022);
    assert!(plan.envp.iter().any(|e| e == "SUDO_USER=alice"));
    assert!(plan.envp.iter().any(|e| e == "SUDO_UID=1000"));
    assert!(plan.envp.iter().any(|e| e.starts_with("SUDO_COMMAND=/bin/ls")));

    assert_eq!(rig.audit.borrow().accepts(), 1);
    assert_eq!(rig.audit.borrow().rejects(), 0);
    assert_eq!(*rig.ts_updates.borrow(), 1);

    // The process is back at its entry credentials.
    let log = rig.creds_log.borrow();
    let last = log.last().expect("credential transitions recorded");
    assert_eq!(last.euid.as_raw(), 0);
    assert_eq!(last.ruid.as_raw(), 1000);
}

#[test]
fn denied_by_rule_yields_deny_with_citation_audit() {
    let tree = ParseTree {
        defaults: Vec::new(),
        userspecs: vec![UserSpec {
            users: vec![Member::of(MemberKind::UserName("alice".to_string()))],
            privileges: vec![Privilege {
                hosts: vec![Member::of(MemberKind::All)],
                cmndspecs: vec![CmndSpec::new(Member::not(MemberKind::All))],
            }],
            origin: Origin::new("/etc/rules", 9, 1),
        }],
    };
    let mut rig = rig(tree);

    rig.engine
        .init(
            &strings(&[]),
            &user_info("alice", 1000),
            &strings(&["PATH=/usr/bin:/bin"]),
        )
        .unwrap();

    let decision = rig.engine.check(&strings(&["/bin/ls"]), &[]).unwrap();
    assert!(!decision.is_allow());
    assert_eq!(rig.audit.borrow().accepts(), 0);
    assert!(rig.audit.borrow().rejects() >= 1);
}

#[test]
fn root_denied_when_root_sudo_is_off() {
    let tree = ParseTree {
        defaults: Vec::new(),
        userspecs: vec![UserSpec {
            users: vec![Member::of(MemberKind::All)],
            privileges: vec![Privilege {
                hosts: vec![Member::of(MemberKind::All)],
                cmndspecs: vec![CmndSpec::new(Member::of(MemberKind::All))],
            }],
            origin: Origin::new("/etc/rules", 1, 1),
        }],
    };
    let mut rig = rig(tree);

    rig.engine
        .init(
            &strings(&["defaults=!root_sudo"]),
            &user_info("root", 0),
            &strings(&["PATH=/usr/bin:/bin"]),
        )
        .unwrap();

    let decision = rig.engine.check(&strings(&["/bin/ls"]), &[]).unwrap();
    assert!(!decision.is_allow());
    // Refused up front; no accept record and no rule-level audit either.
    assert_eq!(rig.audit.borrow().accepts(), 0);
    assert_eq!(rig.audit.borrow().rejects(), 0);
}

#[test]
fn command_found_only_in_dot_is_refused() {
    use std::os::unix::fs::OpenOptionsExt;

    let dir = tempfile::tempdir().unwrap();
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .mode(0o755)
        .open(dir.path().join("dotcmd"))
        .unwrap();
    std::env::set_current_dir(dir.path()).unwrap();

    let tree = ParseTree {
        defaults: Vec::new(),
        userspecs: vec![allow_all_spec(Tags::default())],
    };
    let mut rig = rig(tree);

    rig.engine
        .init(
            &strings(&[]),
            &user_info("alice", 1000),
            &strings(&["PATH=."]),
        )
        .unwrap();

    let decision = rig.engine.check(&strings(&["dotcmd"]), &[]).unwrap();
    std::env::set_current_dir("/").unwrap();
    assert!(!decision.is_allow());

    let audit = rig.audit.borrow();
    assert!(audit
        .events
        .iter()
        .any(|e| e["reason"] == "command in current directory"));
}

#[test]
fn login_shell_reshapes_bash_argv() {
    let tree = ParseTree {
        defaults: Vec::new(),
        userspecs: vec![allow_all_spec(Tags::default())],
    };
    let mut rig = rig(tree);

    rig.engine
        .init(
            &strings(&["runas_user=root", "login_shell=true"]),
            &user_info("alice", 1000),
            &strings(&["PATH=/usr/bin:/bin"]),
        )
        .unwrap();

    let decision = rig
        .engine
        .check(&strings(&["bash", "-c", "echo hi"]), &[])
        .unwrap();

    let Decision::Allow(plan) = decision else {
        panic!("expected an allow decision");
    };
    assert_eq!(plan.argv, vec!["-bash", "--login", "-c", "echo hi"]);
    assert!(plan.envp.iter().any(|e| e == "HOME=/home/root"));
}

#[test]
fn unknown_numeric_runas_is_refused_by_default() {
    let tree = ParseTree {
        defaults: Vec::new(),
        userspecs: vec![UserSpec {
            users: vec![Member::of(MemberKind::UserName("alice".to_string()))],
            privileges: vec![Privilege {
                hosts: vec![Member::of(MemberKind::All)],
                cmndspecs: vec![{
                    let mut cs = CmndSpec::new(Member::of(MemberKind::All));
                    cs.runas = Some(runas_policy::RunasSpec {
                        users: vec![Member::of(MemberKind::All)],
                        groups: Vec::new(),
                    });
                    cs
                }],
            }],
            origin: Origin::new("/etc/rules", 1, 1),
        }],
    };
    let mut rig = rig(tree);

    rig.engine
        .init(
            &strings(&["runas_user=#4242"]),
            &user_info("alice", 1000),
            &strings(&["PATH=/usr/bin:/bin"]),
        )
        .unwrap();

    let decision = rig.engine.check(&strings(&["/bin/ls"]), &[]).unwrap();
    assert!(!decision.is_allow());

    let audit = rig.audit.borrow();
    assert!(audit.events.iter().any(|e| e["reason"] == "unknown user #4242"));
}

#[test]
fn unknown_numeric_runas_allowed_when_opted_in() {
    let tree = ParseTree {
        defaults: vec![runas_policy::DefaultsEntry::flag(
            "runas_allow_unknown_id",
            true,
            Origin::new("/etc/rules", 1, 1),
        )],
        userspecs: vec![UserSpec {
            users: vec![Member::of(MemberKind::UserName("alice".to_string()))],
            privileges: vec![Privilege {
                hosts: vec![Member::of(MemberKind::All)],
                cmndspecs: vec![{
                    let mut cs = CmndSpec::new(Member::of(MemberKind::All));
                    cs.runas = Some(runas_policy::RunasSpec {
                        users: vec![Member::of(MemberKind::All)],
                        groups: Vec::new(),
                    });
                    cs
                }],
            }],
            origin: Origin::new("/etc/rules", 2, 1),
        }],
    };
    let mut rig = rig(tree);

    rig.engine
        .init(
            &strings(&["runas_user=#4242"]),
            &user_info("alice", 1000),
            &strings(&["PATH=/usr/bin:/bin"]),
        )
        .unwrap();

    let decision = rig.engine.check(&strings(&["/bin/ls"]), &[]).unwrap();
    let Decision::Allow(plan) = decision else {
        panic!("expected an allow decision");
    };
    assert_eq!(plan.info.runas_uid, 4242);
}

#[test]
fn preserve_env_without_setenv_is_refused() {
    let tree = ParseTree {
        defaults: Vec::new(),
        userspecs: vec![allow_all_spec(Tags::default())],
    };
    let mut rig = rig(tree);

    rig.engine
        .init(
            &strings(&["preserve_environment=true"]),
            &user_info("alice", 1000),
            &strings(&["PATH=/usr/bin:/bin"]),
        )
        .unwrap();

    let decision = rig.engine.check(&strings(&["/bin/ls"]), &[]).unwrap();
    assert!(!decision.is_allow());

    let audit = rig.audit.borrow();
    assert!(audit
        .events
        .iter()
        .any(|e| e["reason"] == "user not allowed to preserve the environment"));
}

#[test]
fn setenv_tag_permits_preserving_the_environment() {
    let tree = ParseTree {
        defaults: Vec::new(),
        userspecs: vec![allow_all_spec(Tags {
            setenv: Some(true),
            ..Tags::default()
        })],
    };
    let mut rig = rig(tree);

    rig.engine
        .init(
            &strings(&["preserve_environment=true"]),
            &user_info("alice", 1000),
            &strings(&["PATH=/usr/bin:/bin", "MY_TOOL_OPTS=-v"]),
        )
        .unwrap();

    let decision = rig.engine.check(&strings(&["/bin/ls"]), &[]).unwrap();
    let Decision::Allow(plan) = decision else {
        panic!("expected an allow decision");
    };
    // Reset is off; arbitrary variables survive.
    assert!(plan.envp.iter().any(|e| e == "MY_TOOL_OPTS=-v"));
}

#[test]
fn requested_chroot_needs_an_allowance() {
    let tree = ParseTree {
        defaults: Vec::new(),
        userspecs: vec![allow_all_spec(Tags::default())],
    };
    let mut rig = rig(tree);

    rig.engine
        .init(
            &strings(&["cmnd_chroot=/jail"]),
            &user_info("alice", 1000),
            &strings(&["PATH=/usr/bin:/bin"]),
        )
        .unwrap();

    // Resolution inside /jail fails outright; either way the request
    // must not come back allowed.
    match rig.engine.check(&strings(&["/bin/ls"]), &[]) {
        Ok(decision) => assert!(!decision.is_allow()),
        Err(_) => {}
    }
    assert_eq!(rig.audit.borrow().accepts(), 0);
}

#[test]
fn intercept_reentry_masks_the_mode() {
    let tree = ParseTree {
        defaults: vec![runas_policy::DefaultsEntry::flag(
            "intercept",
            true,
            Origin::new("/etc/rules", 1, 1),
        )],
        userspecs: vec![allow_all_spec(Tags {
            nopasswd: Some(true),
            ..Tags::default()
        })],
    };
    let mut rig = rig(tree);

    rig.engine
        .init(
            &strings(&["preserve_groups=true"]),
            &user_info("alice", 1000),
            &strings(&["PATH=/usr/bin:/bin"]),
        )
        .unwrap();

    let first = rig.engine.check(&strings(&["/bin/ls"]), &[]).unwrap();
    let Decision::Allow(plan) = first else {
        panic!("expected an allow decision");
    };
    assert!(plan.info.intercept);
    assert!(rig.engine.mode().contains(ModeFlags::PRESERVE_GROUPS));

    // The approved command spawned a child; the front-end asks again.
    let second = rig.engine.check(&strings(&["/bin/cat"]), &[]).unwrap();
    assert!(second.is_allow());
    assert!(rig.engine.mode().contains(ModeFlags::POLICY_INTERCEPTED));
    assert!(!rig.engine.mode().contains(ModeFlags::PRESERVE_GROUPS));
}

#[test]
fn validate_refreshes_the_credential_cache() {
    let tree = ParseTree {
        defaults: Vec::new(),
        userspecs: vec![allow_all_spec(Tags::default())],
    };
    let mut rig = rig(tree);

    rig.engine
        .init(
            &strings(&[]),
            &user_info("alice", 1000),
            &strings(&["PATH=/usr/bin:/bin"]),
        )
        .unwrap();

    assert!(rig.engine.validate().unwrap());
    assert_eq!(*rig.ts_updates.borrow(), 1);
}

#[test]
fn list_reports_standing_privileges() {
    let tree = ParseTree {
        defaults: Vec::new(),
        userspecs: vec![allow_all_spec(Tags::default())],
    };
    let mut rig = rig(tree);

    rig.engine
        .init(
            &strings(&[]),
            &user_info("alice", 1000),
            &strings(&["PATH=/usr/bin:/bin"]),
        )
        .unwrap();

    assert!(rig.engine.list(&[], None, false).unwrap());

    let err = rig.engine.list(&[], Some("nobody-here"), false).unwrap_err();
    assert!(matches!(
        err,
        runas_policy::Error::Input(runas_policy::modules::error::InputError::UnknownUser(_))
    ));
}

#[test]
fn no_command_is_an_input_error() {
    let tree = ParseTree {
        defaults: Vec::new(),
        userspecs: vec![allow_all_spec(Tags::default())],
    };
    let mut rig = rig(tree);

    rig.engine
        .init(
            &strings(&[]),
            &user_info("alice", 1000),
            &strings(&["PATH=/usr/bin:/bin"]),
        )
        .unwrap();

    let err = rig.engine.check(&[], &[]).unwrap_err();
    assert!(matches!(err, runas_policy::Error::Input(_)));
}
