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
 * The front-end boundary.
 *
 * Requests arrive as flat `key=value` string bundles: one carrying the
 * request settings, one describing the invoking user and their
 * terminal. The decision leaves the same way. The key set is stable;
 * unknown keys are ignored on input so front-end and policy can evolve
 * independently, and the output formatting is deterministic so a
 * record can be parsed and re-emitted byte for byte.
 */

use crate::modules::error::{Error, InputError};
use crate::modules::shared::ModeFlags;

pub fn split_pair(entry: &str) -> Result<(&str, &str), Error> {
    entry
        .split_once('=')
        .ok_or_else(|| InputError::BadBundleEntry(entry.to_string()).into())
}

fn is_true(value: &str) -> bool {
    value == "true"
}

/**
 * Parsed request settings.
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrontendSettings {
    pub flags: ModeFlags,
    pub runas_user: Option<String>,
    pub runas_group: Option<String>,
    pub prompt: Option<String>,
    pub login_class: Option<String>,
    pub selinux_role: Option<String>,
    pub selinux_type: Option<String>,
    pub apparmor_profile: Option<String>,
    pub cmnd_chroot: Option<String>,
    pub cmnd_cwd: Option<String>,
    pub closefrom: Option<i32>,
    pub timeout: Option<u32>,
    pub askpass: Option<String>,
    pub sudoers_uid: Option<u32>,
    pub sudoers_gid: Option<u32>,
    /**
     * Raw settings overrides from the front-end, applied as the first
     * layer on top of the compiled-in values: `name`, `!name` or
     * `name=value`.
     */
    pub defaults: Vec<String>,
}

pub fn parse_settings(settings: &[String]) -> Result<FrontendSettings, Error> {
    let mut out = FrontendSettings::default();
    let mut flags = ModeFlags::RUN;

    for entry in settings {
        let (key, value) = split_pair(entry)?;
        match key {
            "runas_user" => out.runas_user = Some(value.to_string()),
            "runas_group" => out.runas_group = Some(value.to_string()),
            "prompt" => out.prompt = Some(value.to_string()),
            "login_class" => out.login_class = Some(value.to_string()),
            "selinux_role" => out.selinux_role = Some(value.to_string()),
            "selinux_type" => out.selinux_type = Some(value.to_string()),
            "apparmor_profile" => out.apparmor_profile = Some(value.to_string()),
            "cmnd_chroot" => out.cmnd_chroot = Some(value.to_string()),
            "cmnd_cwd" => out.cmnd_cwd = Some(value.to_string()),
            "askpass" => out.askpass = Some(value.to_string()),
            "defaults" => out.defaults.push(value.to_string()),

            "closefrom" => {
                out.closefrom = Some(value.parse().map_err(|_| bad(entry))?);
            }
            "timeout" => {
                out.timeout = Some(value.parse().map_err(|_| bad(entry))?);
            }
            "sudoers_uid" => {
                out.sudoers_uid = Some(value.parse().map_err(|_| bad(entry))?);
            }
            "sudoers_gid" => {
                out.sudoers_gid = Some(value.parse().map_err(|_| bad(entry))?);
            }

            "sudoedit" if is_true(value) => {
                flags.remove(ModeFlags::RUN);
                flags |= ModeFlags::EDIT;
            }
            "login_shell" if is_true(value) => flags |= ModeFlags::LOGIN_SHELL,
            "run_shell" if is_true(value) => flags |= ModeFlags::SHELL,
            "implied_shell" if is_true(value) => flags |= ModeFlags::IMPLIED_SHELL,
            "preserve_environment" if is_true(value) => flags |= ModeFlags::PRESERVE_ENV,
            "preserve_groups" if is_true(value) => flags |= ModeFlags::PRESERVE_GROUPS,
            "noninteractive" if is_true(value) => flags |= ModeFlags::NONINTERACTIVE,
            "ignore_ticket" if is_true(value) => flags |= ModeFlags::IGNORE_TICKET,
            "set_home" if is_true(value) => flags |= ModeFlags::SET_HOME,

            // Unknown keys belong to other plugins; skip them.
            _ => {}
        }
    }

    out.flags = flags;
    Ok(out)
}

fn bad(entry: &str) -> Error {
    InputError::BadBundleEntry(entry.to_string()).into()
}

/**
 * Parsed facts about the invoking user and their terminal.
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrontendUserInfo {
    pub user: String,
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
    pub pid: Option<i32>,
    pub ppid: Option<i32>,
    pub pgid: Option<i32>,
    pub tcpgid: Option<i32>,
    pub sid: Option<i32>,
    pub umask: Option<u32>,
    pub cwd: Option<String>,
    pub tty: Option<String>,
    pub host: Option<String>,
    pub lines: Option<u32>,
    pub cols: Option<u32>,
}

pub fn parse_user_info(user_info: &[String]) -> Result<FrontendUserInfo, Error> {
    let mut out = FrontendUserInfo::default();

    for entry in user_info {
        let (key, value) = split_pair(entry)?;
        match key {
            "user" => out.user = value.to_string(),
            "uid" => out.uid = value.parse().map_err(|_| bad(entry))?,
            "gid" => out.gid = value.parse().map_err(|_| bad(entry))?,
            "groups" => {
                out.groups = value
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.parse().map_err(|_| bad(entry)))
                    .collect::<Result<Vec<u32>, Error>>()?;
            }
            "pid" => out.pid = value.parse().ok(),
            "ppid" => out.ppid = value.parse().ok(),
            "pgid" => out.pgid = value.parse().ok(),
            "tcpgid" => out.tcpgid = value.parse().ok(),
            "sid" => out.sid = value.parse().ok(),
            "umask" => out.umask = u32::from_str_radix(value, 8).ok(),
            "cwd" => out.cwd = Some(value.to_string()),
            "tty" => out.tty = Some(value.to_string()),
            "host" => out.host = Some(value.to_string()),
            "lines" => out.lines = value.parse().ok(),
            "cols" => out.cols = value.parse().ok(),
            _ => {}
        }
    }

    if out.user.is_empty() {
        return Err(InputError::BadBundleEntry("user=".to_string()).into());
    }
    Ok(out)
}

/**
 * The outgoing half of the decision record. Formatting order is fixed
 * so emit → parse → emit reproduces the exact bytes.
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandInfo {
    pub command: String,
    pub runas_uid: u32,
    pub runas_gid: u32,
    pub runas_groups: Vec<u32>,
    pub umask: u32,
    pub iolog_path: Option<String>,
    pub log_input: bool,
    pub log_output: bool,
    pub chroot: Option<String>,
    pub cwd: Option<String>,
    pub timeout: Option<u32>,
    pub closefrom: Option<i32>,
    pub use_pty: bool,
    pub set_utmp: bool,
    pub intercept: bool,
    pub login_class: Option<String>,
    pub selinux_role: Option<String>,
    pub selinux_type: Option<String>,
    pub apparmor_profile: Option<String>,
    pub source: Option<String>,
}

impl CommandInfo {
    pub fn to_bundle(&self) -> Vec<String> {
        let mut out = Vec::new();

        out.push(format!("command={}", self.command));
        out.push(format!("runas_uid={}", self.runas_uid));
        out.push(format!("runas_gid={}", self.runas_gid));
        if !self.runas_groups.is_empty() {
            let groups: Vec<String> = self.runas_groups.iter().map(u32::to_string).collect();
            out.push(format!("runas_groups={}", groups.join(",")));
        }
        out.push(format!("umask=0{:o}", self.umask));
        if let Some(ref path) = self.iolog_path {
            out.push(format!("iolog_path={path}"));
        }
        if self.log_input {
            out.push("iolog_stdin=true".to_string());
        }
        if self.log_output {
            out.push("iolog_stdout=true".to_string());
        }
        if let Some(ref chroot) = self.chroot {
            out.push(format!("chroot={chroot}"));
        }
        if let Some(ref cwd) = self.cwd {
            out.push(format!("cwd={cwd}"));
        }
        if let Some(timeout) = self.timeout {
            out.push(format!("timeout={timeout}"));
        }
        if let Some(closefrom) = self.closefrom {
            out.push(format!("closefrom={closefrom}"));
        }
        if self.use_pty {
            out.push("use_pty=true".to_string());
        }
        if self.set_utmp {
            out.push("set_utmp=true".to_string());
        }
        if self.intercept {
            out.push("intercept=true".to_string());
        }
        if let Some(ref class) = self.login_class {
            out.push(format!("login_class={class}"));
        }
        if let Some(ref role) = self.selinux_role {
            out.push(format!("selinux_role={role}"));
        }
        if let Some(ref stype) = self.selinux_type {
            out.push(format!("selinux_type={stype}"));
        }
        if let Some(ref profile) = self.apparmor_profile {
            out.push(format!("apparmor_profile={profile}"));
        }
        if let Some(ref source) = self.source {
            out.push(format!("source={source}"));
        }

        out
    }

    pub fn from_bundle(bundle: &[String]) -> Result<CommandInfo, Error> {
        let mut out = CommandInfo::default();

        for entry in bundle {
            let (key, value) = split_pair(entry)?;
            match key {
                "command" => out.command = value.to_string(),
                "runas_uid" => out.runas_uid = value.parse().map_err(|_| bad(entry))?,
                "runas_gid" => out.runas_gid = value.parse().map_err(|_| bad(entry))?,
                "runas_groups" => {
                    out.runas_groups = value
                        .split(',')
                        .filter(|s| !s.is_empty())
                        .map(|s| s.parse().map_err(|_| bad(entry)))
                        .collect::<Result<Vec<u32>, Error>>()?;
                }
                "umask" => {
                    out.umask = u32::from_str_radix(value, 8).map_err(|_| bad(entry))?;
                }
                "iolog_path" => out.iolog_path = Some(value.to_string()),
                "iolog_stdin" => out.log_input = is_true(value),
                "iolog_stdout" => out.log_output = is_true(value),
                "chroot" => out.chroot = Some(value.to_string()),
                "cwd" => out.cwd = Some(value.to_string()),
                "timeout" => out.timeout = value.parse().ok(),
                "closefrom" => out.closefrom = value.parse().ok(),
                "use_pty" => out.use_pty = is_true(value),
                "set_utmp" => out.set_utmp = is_true(value),
                "intercept" => out.intercept = is_true(value),
                "login_class" => out.login_class = Some(value.to_string()),
                "selinux_role" => out.selinux_role = Some(value.to_string()),
                "selinux_type" => out.selinux_type = Some(value.to_string()),
                "apparmor_profile" => out.apparmor_profile = Some(value.to_string()),
                "source" => out.source = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn settings_round_out_flags() {
        let settings = vec![
            "runas_user=operator".to_string(),
            "login_shell=true".to_string(),
            "noninteractive=true".to_string(),
            "closefrom=7".to_string(),
            "unknown_key=whatever".to_string(),
        ];

        let parsed = parse_settings(&settings).unwrap();
        assert_eq!(parsed.runas_user.as_deref(), Some("operator"));
        assert_eq!(parsed.closefrom, Some(7));
        assert!(parsed.flags.contains(ModeFlags::RUN));
        assert!(parsed.flags.contains(ModeFlags::LOGIN_SHELL));
        assert!(parsed.flags.contains(ModeFlags::NONINTERACTIVE));
    }

    #[test]
    fn sudoedit_switches_run_to_edit() {
        let parsed = parse_settings(&["sudoedit=true".to_string()]).unwrap();
        assert!(parsed.flags.contains(ModeFlags::EDIT));
        assert!(!parsed.flags.contains(ModeFlags::RUN));
    }

    #[test]
    fn user_info_parses_groups_and_tty() {
        let info = vec![
            "user=alice".to_string(),
            "uid=1000".to_string(),
            "gid=1000".to_string(),
            "groups=1000,10,27".to_string(),
            "tty=/dev/pts/3".to_string(),
            "tcpgid=4242".to_string(),
            "umask=022".to_string(),
            "host=buildhost.example.com".to_string(),
            "cwd=/home/alice".to_string(),
        ];

        let parsed = parse_user_info(&info).unwrap();
        assert_eq!(parsed.user, "alice");
        assert_eq!(parsed.groups, vec![1000, 10, 27]);
        assert_eq!(parsed.tty.as_deref(), Some("/dev/pts/3"));
        assert_eq!(parsed.tcpgid, Some(4242));
        assert_eq!(parsed.umask, Some(0o22));
    }

    #[test]
    fn user_info_requires_a_user() {
        let err = parse_user_info(&["uid=1000".to_string()]).unwrap_err();
        assert!(matches!(err, Error::Input(InputError::BadBundleEntry(_))));
    }

    #[test]
    fn malformed_entry_is_rejected() {
        let err = parse_settings(&["closefrom=banana".to_string()]).unwrap_err();
        assert!(matches!(err, Error::Input(InputError::BadBundleEntry(_))));
    }

    #[test]
    fn command_info_round_trips_byte_identical() {
        let info = CommandInfo {
            command: "/usr/bin/make".to_string(),
            runas_uid: 0,
            runas_gid: 0,
            runas_groups: vec![0, 1, 2],
            umask: 0o022,
            iolog_path: Some("/var/log/io/000001".to_string()),
            log_input: true,
            log_output: true,
            chroot: None,
            cwd: Some("/srv/build".to_string()),
            timeout: Some(300),
            closefrom: Some(3),
            use_pty: true,
            set_utmp: false,
            intercept: true,
            login_class: None,
            selinux_role: Some("sysadm_r".to_string()),
            selinux_type: None,
            apparmor_profile: None,
            source: Some("/etc/rules:12:4".to_string()),
        };

        let bundle = info.to_bundle();
        let reparsed = CommandInfo::from_bundle(&bundle).unwrap();
        assert_eq!(reparsed, info);
        assert_eq!(reparsed.to_bundle(), bundle);
    }
}
