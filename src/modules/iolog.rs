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
 * I/O-log path templates.
 *
 * The directory and file settings may carry identity escapes of the
 * `%{name}` form plus a small set of time fields expanded under the
 * policy locale. Expansion failure is reported to the caller, which
 * decides between aborting the request and disabling I/O logging.
 */

use chrono::{DateTime, Local};

/**
 * The identities available to a template.
 */
pub struct IologEscapes<'a> {
    pub user: &'a str,
    pub group: &'a str,
    pub runas_user: &'a str,
    pub runas_group: &'a str,
    pub hostname: &'a str,
    pub command: &'a str,
    pub seq: Option<&'a str>,
}

/**
 * Expand one template. `None` means an escape could not be resolved.
 */
pub fn expand(template: &str, esc: &IologEscapes<'_>, now: DateTime<Local>) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }

        match chars.peek().copied() {
            Some('{') => {
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => return None,
                    }
                }
                match name.as_str() {
                    "seq" => out.push_str(esc.seq?),
                    "user" => out.push_str(esc.user),
                    "group" => out.push_str(esc.group),
                    "runas_user" => out.push_str(esc.runas_user),
                    "runas_group" => out.push_str(esc.runas_group),
                    "hostname" => out.push_str(esc.hostname),
                    "command" => out.push_str(esc.command),
                    "epoch" => out.push_str(&now.timestamp().to_string()),
                    _ => return None,
                }
            }
            Some('%') => {
                chars.next();
                out.push('%');
            }
            Some(code @ ('Y' | 'y' | 'm' | 'd' | 'j' | 'H' | 'M' | 'S')) => {
                chars.next();
                let fmt = format!("%{code}");
                out.push_str(&now.format(&fmt).to_string());
            }
            _ => return None,
        }
    }

    Some(out)
}

/**
 * Expand the directory and file templates into the final path. The
 * file template additionally sees the expanded directory, matching
 * the layout `<dir>/<file>` the decision record points at.
 */
pub fn expand_iolog_path(
    dir_template: &str,
    file_template: &str,
    esc: &IologEscapes<'_>,
    now: DateTime<Local>,
) -> Option<String> {
    let dir = expand(dir_template, esc, now)?;
    let file = expand(file_template, esc, now)?;
    Some(format!("{dir}/{file}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn escapes<'a>(seq: Option<&'a str>) -> IologEscapes<'a> {
        IologEscapes {
            user: "alice",
            group: "users",
            runas_user: "root",
            runas_group: "root",
            hostname: "buildhost",
            command: "ls",
            seq,
        }
    }

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap()
    }

    #[test]
    fn identity_escapes() {
        let out = expand("%{user}@%{hostname}/%{runas_user}", &escapes(None), at()).unwrap();
        assert_eq!(out, "alice@buildhost/root");
    }

    #[test]
    fn sequence_and_time_escapes() {
        let out = expand_iolog_path(
            "/var/log/io/%Y%m%d",
            "%{seq}",
            &escapes(Some("000003")),
            at(),
        )
        .unwrap();
        assert_eq!(out, "/var/log/io/20240309/000003");
    }

    #[test]
    fn missing_sequence_fails_expansion() {
        assert!(expand("%{seq}", &escapes(None), at()).is_none());
    }

    #[test]
    fn unknown_escape_fails_expansion() {
        assert!(expand("%{nope}", &escapes(None), at()).is_none());
        assert!(expand("%q", &escapes(None), at()).is_none());
    }

    #[test]
    fn literal_percent() {
        assert_eq!(expand("100%%", &escapes(None), at()).unwrap(), "100%");
    }
}
