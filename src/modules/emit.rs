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
 * Decision records and the audit boundary.
 *
 * An allowed request hands the front-end a complete execution plan:
 * the shaped argument vector, the rebuilt environment and the
 * `key=value` command bundle. A denial hands back nothing; none of
 * the allow-side fields exist on that path by construction.
 *
 * Audit events are serializable records pushed through a sink the
 * embedder supplies. The engine emits them at fixed pipeline points
 * and never cares where they end up.
 */

use serde::Serialize;
use tracing::{info, warn};

use crate::modules::wire::CommandInfo;

/**
 * The full execution plan for an approved request.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecPlan {
    pub argv: Vec<String>,
    pub envp: Vec<String>,
    pub info: CommandInfo,
}

/**
 * What the engine tells the front-end. Errors travel separately.
 */
#[derive(Debug)]
pub enum Decision {
    Allow(Box<ExecPlan>),
    Deny,
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }
}

/**
 * Compute the umask for the command. The user's own umask bits are
 * OR-ed in unless the policy overrides them outright; 0o777 in the
 * settings means "leave the umask alone".
 */
pub fn command_umask(def_umask: u32, umask_override: bool, user_umask: Option<u32>) -> u32 {
    if def_umask == 0o777 {
        return user_umask.unwrap_or(0o022);
    }

    let mut mask = def_umask;
    if !umask_override {
        mask |= user_umask.unwrap_or(0);
    }
    mask
}

/**
 * One audit record.
 */
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent<'a> {
    pub action: &'static str,
    pub user: &'a str,
    pub argv: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'a str>,
}

impl<'a> AuditEvent<'a> {
    pub fn success(user: &'a str, argv: &'a [String], command: Option<&'a str>) -> AuditEvent<'a> {
        AuditEvent {
            action: "accept",
            user,
            argv,
            command,
            reason: None,
        }
    }

    pub fn failure(user: &'a str, argv: &'a [String], reason: &'a str) -> AuditEvent<'a> {
        AuditEvent {
            action: "reject",
            user,
            argv,
            command: None,
            reason: Some(reason),
        }
    }
}

/**
 * Where audit records go.
 */
pub trait AuditSink {
    fn audit_success(&mut self, event: &AuditEvent<'_>);
    fn audit_failure(&mut self, event: &AuditEvent<'_>);
}

/**
 * Default sink: structured log lines, JSON-encoded for machine
 * consumption downstream.
 */
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn audit_success(&mut self, event: &AuditEvent<'_>) {
        match serde_json::to_string(event) {
            Ok(json) => info!(target: "audit", %json, "accept"),
            Err(err) => warn!(target: "audit", %err, "unencodable audit event"),
        }
    }

    fn audit_failure(&mut self, event: &AuditEvent<'_>) {
        match serde_json::to_string(event) {
            Ok(json) => warn!(target: "audit", %json, "reject"),
            Err(err) => warn!(target: "audit", %err, "unencodable audit event"),
        }
    }
}

/**
 * A sink that keeps everything, for embedders that forward records
 * elsewhere and for tests.
 */
#[derive(Default)]
pub struct BufferingAudit {
    pub events: Vec<serde_json::Value>,
}

impl BufferingAudit {
    pub fn rejects(&self) -> usize {
        self.events
            .iter()
            .filter(|e| e["action"] == "reject")
            .count()
    }

    pub fn accepts(&self) -> usize {
        self.events
            .iter()
            .filter(|e| e["action"] == "accept")
            .count()
    }
}

impl AuditSink for BufferingAudit {
    fn audit_success(&mut self, event: &AuditEvent<'_>) {
        if let Ok(value) = serde_json::to_value(event) {
            self.events.push(value);
        }
    }

    fn audit_failure(&mut self, event: &AuditEvent<'_>) {
        if let Ok(value) = serde_json::to_value(event) {
            self.events.push(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn umask_merges_user_bits() {
        assert_eq!(command_umask(0o022, false, Some(0o027)), 0o027);
        assert_eq!(command_umask(0o022, false, Some(0o002)), 0o022);
        assert_eq!(command_umask(0o022, true, Some(0o077)), 0o022);
        assert_eq!(command_umask(0o777, false, Some(0o027)), 0o027);
        assert_eq!(command_umask(0o777, false, None), 0o022);
    }

    #[test]
    fn buffering_sink_counts_actions() {
        let argv = vec!["/bin/ls".to_string()];
        let mut sink = BufferingAudit::default();

        sink.audit_success(&AuditEvent::success("alice", &argv, Some("/bin/ls")));
        sink.audit_failure(&AuditEvent::failure("alice", &argv, "denied by rule"));
        sink.audit_failure(&AuditEvent::failure("alice", &argv, "command not found"));

        assert_eq!(sink.accepts(), 1);
        assert_eq!(sink.rejects(), 2);
        assert_eq!(sink.events[1]["reason"], "denied by rule");
    }

    #[test]
    fn deny_carries_no_plan() {
        let decision = Decision::Deny;
        assert!(!decision.is_allow());
    }
}
