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
 * Rule evaluation.
 *
 * Sources are walked in configuration order; within a source, user
 * specifications in file order. A candidate is scored over five
 * dimensions in a fixed order: user, host, target identity, command,
 * date window. The last rule to produce a command-level decision inside
 * a source wins, and the first source to produce one settles the
 * request. The winning rule is recorded as soon as a command-level
 * decision exists, so even a denial carries its citation.
 *
 * List and validate style requests take the password-check shortcut:
 * no single command is being judged, only whether the user holds any
 * applicable privilege and whether proving their identity is required
 * for the answer.
 */

use bitflags::bitflags;
use nix::unistd::Gid;

use crate::modules::defaults::PasswdCheck;
use crate::modules::rules::{CmndSpec, Member, MemberKind, Origin, RunasSpec, Tags};
use crate::modules::sources::SourceList;
use crate::modules::user::{Group, User, UserDb};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ValidationFlags: u32 {
        const SUCCESS   = 0x0001;
        const FAILURE   = 0x0002;
        const ERROR     = 0x0004;
        const NO_USER   = 0x0010;
        const NO_HOST   = 0x0020;
        const NOPASSWD  = 0x0100;
        const SETENV    = 0x0200;
        const INTERCEPT = 0x0400;
    }
}

/**
 * The winning rule, flattened for the rest of the pipeline.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchInfo {
    pub origin: Origin,
    pub tags: Tags,
    pub timeout: Option<u32>,
    pub runchroot: Option<String>,
    pub runcwd: Option<String>,
    pub role: Option<String>,
    pub selinux_type: Option<String>,
    pub apparmor_profile: Option<String>,
    pub allowed: bool,
}

/**
 * Everything the matcher needs to know about one request.
 */
pub struct LookupRequest<'a> {
    pub db: &'a UserDb,
    pub user: &'a User,
    pub user_gids: &'a [Gid],
    pub host: &'a str,
    pub shost: &'a str,
    pub runas_user: &'a User,
    pub runas_group: Option<&'a Group>,
    pub runas_default: &'a str,
    pub cmnd_path: Option<&'a str>,
    pub cmnd_args: Option<&'a str>,
    pub now: i64,
}

/**
 * Evaluate the request against every source.
 *
 * `record` fires each time a rule produces a command-level decision;
 * the last call describes the winning rule. The same information is
 * returned for convenience.
 */
pub fn lookup(
    sources: &SourceList,
    req: &LookupRequest<'_>,
    pwflag: Option<PasswdCheck>,
    mut record: impl FnMut(&MatchInfo),
) -> (ValidationFlags, Option<MatchInfo>) {
    if let Some(check) = pwflag {
        return lookup_pwflag(sources, req, check);
    }

    let mut user_seen = false;
    let mut host_seen = false;

    for source in sources.iter() {
        let Some(tree) = source.tree() else {
            continue;
        };

        let mut winner: Option<MatchInfo> = None;

        for us in &tree.userspecs {
            if !matches(list_match(&us.users, |kind| user_member(req, kind))) {
                continue;
            }
            user_seen = true;

            for priv_ in &us.privileges {
                if !matches(list_match(&priv_.hosts, |kind| host_member(req, kind))) {
                    continue;
                }
                host_seen = true;

                let mut prev_tags = Tags::default();
                for cs in &priv_.cmndspecs {
                    let tags = cs.tags.inherit(&prev_tags);
                    prev_tags = tags;

                    if !date_ok(cs, req.now) {
                        continue;
                    }
                    if !runas_match(req, cs.runas.as_ref()) {
                        continue;
                    }

                    let Some(decision) = cmnd_match(req, &cs.cmnd) else {
                        continue;
                    };

                    let info = MatchInfo {
                        origin: us.origin.clone(),
                        tags,
                        timeout: cs.timeout,
                        runchroot: cs.runchroot.clone(),
                        runcwd: cs.runcwd.clone(),
                        role: cs.role.clone(),
                        selinux_type: cs.selinux_type.clone(),
                        apparmor_profile: cs.apparmor_profile.clone(),
                        allowed: decision,
                    };
                    record(&info);
                    winner = Some(info);
                }
            }
        }

        if let Some(info) = winner {
            let mut flags = if info.allowed {
                ValidationFlags::SUCCESS
            } else {
                ValidationFlags::FAILURE
            };
            if info.tags.nopasswd == Some(true) {
                flags |= ValidationFlags::NOPASSWD;
            }
            if info.tags.setenv == Some(true) {
                flags |= ValidationFlags::SETENV;
            }
            if info.tags.intercept == Some(true) {
                flags |= ValidationFlags::INTERCEPT;
            }
            return (flags, Some(info));
        }
    }

    let mut flags = ValidationFlags::FAILURE;
    if !user_seen {
        flags |= ValidationFlags::NO_USER;
    }
    if !host_seen {
        flags |= ValidationFlags::NO_HOST;
    }
    (flags, None)
}

/**
 * List/validate style evaluation: does the user hold any privilege
 * here, and do they have to prove who they are to use or see it?
 */
fn lookup_pwflag(
    sources: &SourceList,
    req: &LookupRequest<'_>,
    check: PasswdCheck,
) -> (ValidationFlags, Option<MatchInfo>) {
    let mut matched = 0usize;
    let mut nopasswd = 0usize;
    let mut user_seen = false;

    for source in sources.iter() {
        let Some(tree) = source.tree() else {
            continue;
        };

        for us in &tree.userspecs {
            if !matches(list_match(&us.users, |kind| user_member(req, kind))) {
                continue;
            }
            user_seen = true;

            for priv_ in &us.privileges {
                if !matches(list_match(&priv_.hosts, |kind| host_member(req, kind))) {
                    continue;
                }

                let mut prev_tags = Tags::default();
                for cs in &priv_.cmndspecs {
                    let tags = cs.tags.inherit(&prev_tags);
                    prev_tags = tags;

                    matched += 1;
                    if tags.nopasswd == Some(true) {
                        nopasswd += 1;
                    }
                }
            }
        }
    }

    if matched == 0 {
        let mut flags = ValidationFlags::FAILURE;
        if !user_seen {
            flags |= ValidationFlags::NO_USER;
        }
        return (flags, None);
    }

    let mut flags = ValidationFlags::SUCCESS;
    let exempt = match check {
        PasswdCheck::Never => true,
        PasswdCheck::Any => nopasswd > 0,
        PasswdCheck::All => nopasswd == matched,
        PasswdCheck::Always => false,
    };
    if exempt {
        flags |= ValidationFlags::NOPASSWD;
    }
    (flags, None)
}

/**
 * Whether a scoped settings entry applies to this request. Used when
 * layering host-, user-, runas- and command-bound entries.
 */
pub fn binding_matches(req: &LookupRequest<'_>, binding: &crate::modules::rules::Binding) -> bool {
    use crate::modules::rules::Binding;

    match binding {
        Binding::Generic => true,
        Binding::Host(list) => matches(list_match(list, |kind| host_member(req, kind))),
        Binding::User(list) => matches(list_match(list, |kind| user_member(req, kind))),
        Binding::Runas(list) => matches(list_match(list, |kind| runas_user_member(req, kind))),
        Binding::Cmnd(list) => {
            let mut result = None;
            for member in list {
                if let Some(hit) = cmnd_match(req, member) {
                    result = Some(hit);
                }
            }
            result == Some(true)
        }
    }
}

fn matches(result: Option<bool>) -> bool {
    result == Some(true)
}

/**
 * Walk a member list in order; the last member to produce a decision
 * wins, with negation flipping it. `None` means no member spoke up.
 */
fn list_match(members: &[Member], mut base: impl FnMut(&MemberKind) -> bool) -> Option<bool> {
    let mut result = None;

    for member in members {
        if base(&member.kind) {
            result = Some(!member.negated);
        }
    }

    result
}

fn user_member(req: &LookupRequest<'_>, kind: &MemberKind) -> bool {
    match kind {
        MemberKind::All => true,
        MemberKind::UserName(name) => name == &req.user.name,
        MemberKind::UserId(uid) => *uid == req.user.uid.as_raw(),
        MemberKind::GroupName(group) => req.db.user_in_group(req.user, req.user_gids, group),
        MemberKind::GroupId(gid) => {
            req.user_gids.contains(&Gid::from_raw(*gid)) || req.user.gid.as_raw() == *gid
        }
        _ => false,
    }
}

fn host_member(req: &LookupRequest<'_>, kind: &MemberKind) -> bool {
    match kind {
        MemberKind::All => true,
        MemberKind::HostName(host) => host == req.host || host == req.shost,
        _ => false,
    }
}

fn date_ok(cs: &CmndSpec, now: i64) -> bool {
    if let Some(notbefore) = cs.notbefore {
        if now < notbefore {
            return false;
        }
    }
    if let Some(notafter) = cs.notafter {
        if now > notafter {
            return false;
        }
    }
    true
}

/**
 * Target-identity matching. An absent or empty runas user list covers
 * only the configured default target. A requested group must be named
 * by the rule unless it is the matched target user's primary group.
 */
fn runas_match(req: &LookupRequest<'_>, spec: Option<&RunasSpec>) -> bool {
    let users = spec.map(|s| s.users.as_slice()).unwrap_or(&[]);
    let groups = spec.map(|s| s.groups.as_slice()).unwrap_or(&[]);

    let user_ok = if users.is_empty() {
        req.runas_user.name == req.runas_default
    } else {
        matches(list_match(users, |kind| runas_user_member(req, kind)))
    };
    if !user_ok {
        return false;
    }

    match req.runas_group {
        None => true,
        Some(group) => {
            if group.gid == req.runas_user.gid {
                return true;
            }
            matches(list_match(groups, |kind| match kind {
                MemberKind::All => true,
                MemberKind::GroupName(name) => name == &group.name,
                MemberKind::GroupId(gid) => *gid == group.gid.as_raw(),
                _ => false,
            }))
        }
    }
}

fn runas_user_member(req: &LookupRequest<'_>, kind: &MemberKind) -> bool {
    match kind {
        MemberKind::All => true,
        MemberKind::UserName(name) => name == &req.runas_user.name,
        MemberKind::UserId(uid) => *uid == req.runas_user.uid.as_raw(),
        MemberKind::GroupName(group) => {
            let gids = [req.runas_user.gid];
            req.db.user_in_group(req.runas_user, &gids, group)
        }
        MemberKind::GroupId(gid) => req.runas_user.gid.as_raw() == *gid,
        _ => false,
    }
}

/**
 * Command matching. `Some(true)` allows, `Some(false)` is an explicit
 * denial (a negated command member), `None` no opinion. Absent command
 * facts (validate requests) only match the wildcard.
 */
fn cmnd_match(req: &LookupRequest<'_>, member: &Member) -> Option<bool> {
    let hit = match &member.kind {
        MemberKind::All => true,
        MemberKind::Command { path, args } => match req.cmnd_path {
            Some(cmnd) => {
                if path != cmnd {
                    false
                } else {
                    match args {
                        None => true,
                        Some(rule_args) => {
                            let joined = rule_args.join(" ");
                            joined == req.cmnd_args.unwrap_or("")
                        }
                    }
                }
            }
            None => false,
        },
        MemberKind::Directory(dir) => match req.cmnd_path {
            Some(cmnd) => cmnd
                .strip_prefix(dir.as_str())
                .map(|rest| !rest.is_empty() && !rest.contains('/'))
                .unwrap_or(false),
            None => false,
        },
        _ => false,
    };

    if hit {
        Some(!member.negated)
    } else {
        None
    }
}
