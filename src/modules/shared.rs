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
 * Shared flags, constants and small helpers used across the policy engine.
 *
 * The `ModeFlags` bitset mirrors the request mode negotiated with the
 * front-end: exactly one of the operation bits (RUN, EDIT, VALIDATE,
 * INVALIDATE, LIST) is set per request, the remainder are modifiers.
 */

use bitflags::bitflags;
use cfg_if::cfg_if;

pub const PATH_TTY: &str = "/dev/tty";
pub const PATH_ENVIRONMENT: &str = "/etc/environment";
pub const PATH_STOCK: &str = "/usr/bin:/bin:/usr/sbin:/sbin";
pub const DEFAULT_EDITOR: &str = "vi";
pub const DEFAULT_PROMPT: &str = "Password: ";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct ModeFlags: u32 {
        const NONE               = 0x00000000;
        const RUN                = 0x00000001;
        const EDIT               = 0x00000002;
        const VALIDATE           = 0x00000004;
        const INVALIDATE         = 0x00000008;
        const LIST               = 0x00000010;
        const CHECK              = 0x00000020;
        const LOGIN_SHELL        = 0x00000100;
        const SHELL              = 0x00000200;
        const IMPLIED_SHELL      = 0x00000400;
        const PRESERVE_ENV       = 0x00000800;
        const PRESERVE_GROUPS    = 0x00001000;
        const NONINTERACTIVE     = 0x00002000;
        const IGNORE_TICKET      = 0x00004000;
        const SET_HOME           = 0x00008000;
        const POLICY_INTERCEPTED = 0x00010000;
    }
}

impl Default for ModeFlags {
    fn default() -> ModeFlags {
        ModeFlags::NONE
    }
}

impl ModeFlags {
    /**
     * The subset of flags an intercepted sub-command request may carry.
     * Everything else is stripped before the pipeline is re-run.
     */
    pub fn intercept_mask() -> ModeFlags {
        ModeFlags::RUN
            | ModeFlags::NONINTERACTIVE
            | ModeFlags::IGNORE_TICKET
            | ModeFlags::POLICY_INTERCEPTED
    }
}

/**
 * Join an argument vector into a single space-separated string.
 *
 * When `unescape` is set, the backslash escapes the front-end introduced
 * for shell meta characters are reversed so matching and logging see the
 * command line the user actually typed. An escape before a space is kept,
 * it separates words inside one argument.
 */
pub fn strvec_join(args: &[String], unescape: bool) -> String {
    let mut out = String::new();

    for (n, arg) in args.iter().enumerate() {
        if n > 0 {
            out.push(' ');
        }

        if !unescape {
            out.push_str(arg);
            continue;
        }

        let mut chars = arg.chars().peekable();
        while let Some(ch) = chars.next() {
            if ch == '\\' {
                match chars.peek() {
                    Some(&next) if next != ' ' && next != '\t' => {
                        out.push(next);
                        chars.next();
                        continue;
                    }
                    _ => {}
                }
            }
            out.push(ch);
        }
    }

    out
}

/**
 * Return the final path component, or the whole string if there is none.
 */
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

cfg_if! {
    if #[cfg(unix)] {
        use std::ffi::{CStr, CString};

        /**
         * Scoped locale swap.
         *
         * Rule evaluation and I/O-log path expansion run under the locale
         * configured in the policy files; every other user-visible message
         * uses the locale the process was started with. The guard restores
         * the previous locale when dropped, on every exit path.
         */
        pub struct LocaleGuard {
            saved: Option<CString>,
        }

        impl LocaleGuard {
            pub fn enter(locale: &str) -> LocaleGuard {
                let saved = unsafe {
                    let cur = libc::setlocale(libc::LC_ALL, std::ptr::null());
                    if cur.is_null() {
                        None
                    } else {
                        Some(CStr::from_ptr(cur).to_owned())
                    }
                };

                if let Ok(want) = CString::new(locale) {
                    // SAFETY: want is a valid NUL-terminated string.
                    unsafe { libc::setlocale(libc::LC_ALL, want.as_ptr()) };
                }

                LocaleGuard { saved }
            }
        }

        impl Drop for LocaleGuard {
            fn drop(&mut self) {
                if let Some(prev) = self.saved.take() {
                    unsafe { libc::setlocale(libc::LC_ALL, prev.as_ptr()) };
                }
            }
        }
    } else {
        pub struct LocaleGuard;

        impl LocaleGuard {
            pub fn enter(_locale: &str) -> LocaleGuard {
                LocaleGuard
            }
        }
    }
}
