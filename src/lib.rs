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
 * runas-policy — the decision half of a privilege elevation tool.
 *
 * A setuid front-end collects the request (who is asking, on which
 * terminal, for which command, as whom) and hands it over as flat
 * `key=value` bundles. This crate answers it: it layers the settings,
 * walks the configured rule sources, locates the command along a
 * trusted search path, gates on authentication and hands back either
 * a complete execution plan or a refusal. The front-end performs the
 * actual exec; nothing in here ever spawns the target process.
 *
 * External collaborators are injected as traits: the credential
 * database, the credential syscalls, the rule-file grammar parser,
 * the authentication backend, the authentication-cache store, the
 * audit sink and the login-class database. That keeps the decision
 * pipeline deterministic and testable without root.
 *
 * ### Request flow
 * ```text
 * init(settings, user_info, envp)
 *     → check(argv)   →  ExecPlan | Deny | error
 *     → validate()    →  refresh cached credential
 *     → list(argv)    →  standing privileges / single-command check
 *     → cleanup()
 * ```
 */

pub mod modules {
    pub mod auth;
    pub mod defaults;
    pub mod emit;
    pub mod env;
    pub mod error;
    pub mod iolog;
    pub mod lookup;
    pub mod path;
    pub mod perms;
    pub mod policy;
    pub mod rules;
    pub mod shared;
    pub mod sources;
    pub mod user;
    pub mod wire;
}

pub use modules::auth::{AuthOutcome, Authenticator, NullTimestamp, TicketStatus, TimestampStore};
pub use modules::defaults::{Defaults, PasswdCheck, SetScope};
pub use modules::emit::{AuditEvent, AuditSink, BufferingAudit, Decision, ExecPlan, TracingAudit};
pub use modules::env::{Environment, LoginClassDb, NullLoginClass};
pub use modules::error::Error;
pub use modules::lookup::{MatchInfo, ValidationFlags};
pub use modules::path::CommandStatus;
pub use modules::perms::{CredOps, Creds, PermStack, PermState, SystemCreds};
pub use modules::policy::{Engine, EngineConfig, RunasContext, UserContext};
pub use modules::rules::{
    Binding, CmndSpec, DefaultsEntry, DefaultsOp, DefaultsValue, Member, MemberKind, Origin,
    ParseTree, Privilege, RunasSpec, Tags, UserSpec,
};
pub use modules::shared::ModeFlags;
pub use modules::sources::{FileOwner, FileSource, ParseEngine, RuleSource, SourceList, StaticSource};
pub use modules::user::{Group, NameService, SystemNss, User, UserDb};
pub use modules::wire::CommandInfo;
