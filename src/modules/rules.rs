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
 * The rule data model.
 *
 * Rules follow the classic three-level shape: a user specification says
 * which users it covers, each privilege inside it says on which hosts,
 * and each command specification inside a privilege says which commands
 * under which target identities and tags. The grammar parser that builds
 * these trees from policy-file text is an external collaborator; this
 * module only defines the tree the rest of the engine walks.
 */

use std::fmt;

/**
 * Where a rule or settings entry came from, for diagnostics and the
 * decision record citation.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl Origin {
    pub fn new(file: &str, line: u32, column: u32) -> Origin {
        Origin {
            file: file.to_string(),
            line,
            column,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line == 0 {
            write!(f, "{}", self.file)
        } else {
            write!(f, "{}:{}:{}", self.file, self.line, self.column)
        }
    }
}

/**
 * A single list member, possibly negated. Member lists are evaluated in
 * order with the last match winning, so `ALL, !wheel` differs from
 * `!wheel, ALL`.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub negated: bool,
    pub kind: MemberKind,
}

impl Member {
    pub fn of(kind: MemberKind) -> Member {
        Member { negated: false, kind }
    }

    pub fn not(kind: MemberKind) -> Member {
        Member { negated: true, kind }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberKind {
    All,
    UserName(String),
    UserId(u32),
    GroupName(String),
    GroupId(u32),
    HostName(String),
    /**
     * A fully-qualified command with an optional exact argument list.
     * `args: None` matches any arguments, `Some(vec![])` only a bare
     * invocation.
     */
    Command {
        path: String,
        args: Option<Vec<String>>,
    },
    /**
     * A directory member (trailing slash in policy-file syntax) matching
     * any file directly inside it.
     */
    Directory(String),
}

/**
 * Per-command tags. `None` means unspecified, which inherits from the
 * preceding command specification in the same privilege.
 */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tags {
    pub nopasswd: Option<bool>,
    pub setenv: Option<bool>,
    pub intercept: Option<bool>,
}

impl Tags {
    /**
     * Fill unspecified slots from `prev`, the tag-inheritance rule for
     * comma-separated command lists.
     */
    pub fn inherit(&self, prev: &Tags) -> Tags {
        Tags {
            nopasswd: self.nopasswd.or(prev.nopasswd),
            setenv: self.setenv.or(prev.setenv),
            intercept: self.intercept.or(prev.intercept),
        }
    }
}

/**
 * The target-identity part of a command specification.
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunasSpec {
    pub users: Vec<Member>,
    pub groups: Vec<Member>,
}

/**
 * One command under one set of runas constraints.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmndSpec {
    pub runas: Option<RunasSpec>,
    pub tags: Tags,
    pub cmnd: Member,
    pub notbefore: Option<i64>,
    pub notafter: Option<i64>,
    pub timeout: Option<u32>,
    pub runchroot: Option<String>,
    pub runcwd: Option<String>,
    pub role: Option<String>,
    pub selinux_type: Option<String>,
    pub apparmor_profile: Option<String>,
}

impl CmndSpec {
    pub fn new(cmnd: Member) -> CmndSpec {
        CmndSpec {
            runas: None,
            tags: Tags::default(),
            cmnd,
            notbefore: None,
            notafter: None,
            timeout: None,
            runchroot: None,
            runcwd: None,
            role: None,
            selinux_type: None,
            apparmor_profile: None,
        }
    }
}

/**
 * A host constraint wrapping a list of command specifications.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Privilege {
    pub hosts: Vec<Member>,
    pub cmndspecs: Vec<CmndSpec>,
}

/**
 * The outermost rule level.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSpec {
    pub users: Vec<Member>,
    pub privileges: Vec<Privilege>,
    pub origin: Origin,
}

/**
 * Scope binding of a settings entry.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Generic,
    Host(Vec<Member>),
    User(Vec<Member>),
    Runas(Vec<Member>),
    Cmnd(Vec<Member>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultsOp {
    Enable,
    Disable,
    Assign,
    Append,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultsValue {
    None,
    Str(String),
    List(Vec<String>),
}

/**
 * One settings entry from a policy file or the front-end.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultsEntry {
    pub binding: Binding,
    pub name: String,
    pub op: DefaultsOp,
    pub value: DefaultsValue,
    pub origin: Origin,
}

impl DefaultsEntry {
    pub fn flag(name: &str, on: bool, origin: Origin) -> DefaultsEntry {
        DefaultsEntry {
            binding: Binding::Generic,
            name: name.to_string(),
            op: if on { DefaultsOp::Enable } else { DefaultsOp::Disable },
            value: DefaultsValue::None,
            origin,
        }
    }

    pub fn assign(name: &str, value: &str, origin: Origin) -> DefaultsEntry {
        DefaultsEntry {
            binding: Binding::Generic,
            name: name.to_string(),
            op: DefaultsOp::Assign,
            value: DefaultsValue::Str(value.to_string()),
            origin,
        }
    }
}

/**
 * A parsed rule source: settings entries plus user specifications, in
 * file order.
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseTree {
    pub defaults: Vec<DefaultsEntry>,
    pub userspecs: Vec<UserSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_citation_format() {
        let o = Origin::new("/etc/rules", 12, 4);
        assert_eq!(o.to_string(), "/etc/rules:12:4");

        let f = Origin::new("/etc/rules", 0, 0);
        assert_eq!(f.to_string(), "/etc/rules");
    }

    #[test]
    fn tags_inherit_only_unspecified() {
        let prev = Tags { nopasswd: Some(true), setenv: Some(false), intercept: None };
        let cur = Tags { nopasswd: None, setenv: Some(true), intercept: None };
        let merged = cur.inherit(&prev);

        assert_eq!(merged.nopasswd, Some(true));
        assert_eq!(merged.setenv, Some(true));
        assert_eq!(merged.intercept, None);
    }
}
