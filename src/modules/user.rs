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
 * User and Group abstractions for system identity management.
 *
 * This module provides safe wrappers around POSIX user and group database
 * access, integrating `libc` and `nix::unistd` behind the `NameService`
 * trait so the credential backend can be swapped out in tests.
 *
 * `UserDb` layers a request-scoped cache on top: entries are shared
 * (`Rc`), both positive and negative lookups are remembered, and unknown
 * identities can be synthesized as fake entries so a request carrying a
 * numeric id that is absent from the password database can still be
 * evaluated (and rejected with a proper message) further down the line.
 */

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;

use nix::unistd::{Gid, Uid};

use crate::modules::error::{Error, InputError};

/**
 * Represents a system user entry.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
    pub home: String,
    pub shell: String,
}

impl User {
    pub fn is_root(&self) -> bool {
        self.uid.is_root()
    }
}

/**
 * Represents a system group entry, including its member names.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    pub gid: Gid,
    pub members: Vec<String>,
}

/**
 * Credential database backend. The system implementation asks the real
 * user/group databases; tests substitute an in-memory table.
 */
pub trait NameService {
    fn user_by_name(&self, name: &str) -> io::Result<Option<User>>;
    fn user_by_uid(&self, uid: Uid) -> io::Result<Option<User>>;
    fn group_by_name(&self, name: &str) -> io::Result<Option<Group>>;
    fn group_by_gid(&self, gid: Gid) -> io::Result<Option<Group>>;

    /**
     * All group ids the user is a member of, primary gid included.
     */
    fn group_list(&self, user: &User) -> io::Result<Vec<Gid>>;
}

/**
 * `NameService` backed by the host's passwd and group databases.
 */
pub struct SystemNss;

impl NameService for SystemNss {
    fn user_by_name(&self, name: &str) -> io::Result<Option<User>> {
        let entry = nix::unistd::User::from_name(name)
            .map_err(io::Error::from)?;
        Ok(entry.map(from_nix_user))
    }

    fn user_by_uid(&self, uid: Uid) -> io::Result<Option<User>> {
        let entry = nix::unistd::User::from_uid(uid)
            .map_err(io::Error::from)?;
        Ok(entry.map(from_nix_user))
    }

    fn group_by_name(&self, name: &str) -> io::Result<Option<Group>> {
        let entry = nix::unistd::Group::from_name(name)
            .map_err(io::Error::from)?;
        Ok(entry.map(from_nix_group))
    }

    fn group_by_gid(&self, gid: Gid) -> io::Result<Option<Group>> {
        let entry = nix::unistd::Group::from_gid(gid)
            .map_err(io::Error::from)?;
        Ok(entry.map(from_nix_group))
    }

    fn group_list(&self, user: &User) -> io::Result<Vec<Gid>> {
        let username = std::ffi::CString::new(user.name.as_str())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let gid: libc::gid_t = user.gid.as_raw();
        let mut ngroups: libc::c_int = 0;

        // First call: get the required number of groups
        unsafe {
            libc::getgrouplist(username.as_ptr(), gid, std::ptr::null_mut(), &mut ngroups);
        }

        let mut raw_gids = vec![0 as libc::gid_t; ngroups.max(0) as usize];

        // Second call: actually fill the vector
        let rc = unsafe {
            libc::getgrouplist(username.as_ptr(), gid, raw_gids.as_mut_ptr(), &mut ngroups)
        };
        if rc == -1 {
            return Err(io::Error::other("group list truncated"));
        }
        raw_gids.truncate(ngroups.max(0) as usize);

        Ok(raw_gids.into_iter().map(Gid::from_raw).collect())
    }
}

fn from_nix_user(u: nix::unistd::User) -> User {
    User {
        name: u.name,
        uid: u.uid,
        gid: u.gid,
        home: u.dir.to_string_lossy().into_owned(),
        shell: u.shell.to_string_lossy().into_owned(),
    }
}

fn from_nix_group(g: nix::unistd::Group) -> Group {
    Group {
        name: g.name,
        gid: g.gid,
        members: g.mem.clone(),
    }
}

/**
 * Result of resolving a requested runas identity: the entry plus whether
 * it had to be synthesized because the numeric id is unknown.
 */
#[derive(Debug)]
pub struct RunasLookup<T> {
    pub entry: Rc<T>,
    pub unknown_id: bool,
}

/**
 * Request-scoped, reference-counted credential cache.
 */
pub struct UserDb {
    nss: Box<dyn NameService>,
    users_by_name: RefCell<HashMap<String, Option<Rc<User>>>>,
    users_by_uid: RefCell<HashMap<u32, Option<Rc<User>>>>,
    groups_by_name: RefCell<HashMap<String, Option<Rc<Group>>>>,
    groups_by_gid: RefCell<HashMap<u32, Option<Rc<Group>>>>,
    group_lists: RefCell<HashMap<String, Rc<Vec<Gid>>>>,
}

impl UserDb {
    pub fn new(nss: Box<dyn NameService>) -> UserDb {
        UserDb {
            nss,
            users_by_name: RefCell::new(HashMap::new()),
            users_by_uid: RefCell::new(HashMap::new()),
            groups_by_name: RefCell::new(HashMap::new()),
            groups_by_gid: RefCell::new(HashMap::new()),
            group_lists: RefCell::new(HashMap::new()),
        }
    }

    pub fn user_by_name(&self, name: &str) -> io::Result<Option<Rc<User>>> {
        if let Some(hit) = self.users_by_name.borrow().get(name) {
            return Ok(hit.clone());
        }

        let found = self.nss.user_by_name(name)?.map(Rc::new);
        self.remember_user(name, found.clone());
        Ok(found)
    }

    pub fn user_by_uid(&self, uid: Uid) -> io::Result<Option<Rc<User>>> {
        if let Some(hit) = self.users_by_uid.borrow().get(&uid.as_raw()) {
            return Ok(hit.clone());
        }

        let found = self.nss.user_by_uid(uid)?.map(Rc::new);
        self.users_by_uid.borrow_mut().insert(uid.as_raw(), found.clone());
        if let Some(ref user) = found {
            self.users_by_name
                .borrow_mut()
                .entry(user.name.clone())
                .or_insert_with(|| Some(user.clone()));
        }
        Ok(found)
    }

    pub fn group_by_name(&self, name: &str) -> io::Result<Option<Rc<Group>>> {
        if let Some(hit) = self.groups_by_name.borrow().get(name) {
            return Ok(hit.clone());
        }

        let found = self.nss.group_by_name(name)?.map(Rc::new);
        self.groups_by_name.borrow_mut().insert(name.to_string(), found.clone());
        if let Some(ref group) = found {
            self.groups_by_gid
                .borrow_mut()
                .entry(group.gid.as_raw())
                .or_insert_with(|| Some(group.clone()));
        }
        Ok(found)
    }

    pub fn group_by_gid(&self, gid: Gid) -> io::Result<Option<Rc<Group>>> {
        if let Some(hit) = self.groups_by_gid.borrow().get(&gid.as_raw()) {
            return Ok(hit.clone());
        }

        let found = self.nss.group_by_gid(gid)?.map(Rc::new);
        self.groups_by_gid.borrow_mut().insert(gid.as_raw(), found.clone());
        Ok(found)
    }

    /**
     * Synthesize a user entry for an id that is not in the database.
     * The entry is cached under both name and uid so later lookups in
     * the same request stay consistent.
     */
    pub fn make_fake_user(&self, name: &str, uid: Uid, gid: Gid) -> Rc<User> {
        let user = Rc::new(User {
            name: name.to_string(),
            uid,
            gid,
            home: "/".to_string(),
            shell: "/bin/sh".to_string(),
        });

        self.remember_user(name, Some(user.clone()));
        self.users_by_uid.borrow_mut().insert(uid.as_raw(), Some(user.clone()));
        user
    }

    pub fn make_fake_group(&self, name: &str, gid: Gid) -> Rc<Group> {
        let group = Rc::new(Group {
            name: name.to_string(),
            gid,
            members: Vec::new(),
        });

        self.groups_by_name.borrow_mut().insert(name.to_string(), Some(group.clone()));
        self.groups_by_gid.borrow_mut().insert(gid.as_raw(), Some(group.clone()));
        group
    }

    /**
     * Resolve a requested target user. A leading `#` followed by a
     * decimal integer selects by uid; an unknown uid yields a fake entry
     * flagged `unknown_id` so the caller can enforce policy on it. If the
     * integer does not parse the string falls through to a name lookup.
     */
    pub fn resolve_runas_user(&self, spec: &str, fallback_gid: Gid) -> Result<RunasLookup<User>, Error> {
        if let Some(rest) = spec.strip_prefix('#') {
            if let Ok(raw) = rest.parse::<u32>() {
                let uid = Uid::from_raw(raw);
                match self.user_by_uid(uid).map_err(nss_err)? {
                    Some(user) => {
                        return Ok(RunasLookup { entry: user, unknown_id: false });
                    }
                    None => {
                        let fake = self.make_fake_user(spec, uid, fallback_gid);
                        return Ok(RunasLookup { entry: fake, unknown_id: true });
                    }
                }
            }
        }

        match self.user_by_name(spec).map_err(nss_err)? {
            Some(user) => Ok(RunasLookup { entry: user, unknown_id: false }),
            None => Err(InputError::UnknownUser(spec.to_string()).into()),
        }
    }

    /**
     * Same numeric-id handling for the requested target group.
     */
    pub fn resolve_runas_group(&self, spec: &str) -> Result<RunasLookup<Group>, Error> {
        if let Some(rest) = spec.strip_prefix('#') {
            if let Ok(raw) = rest.parse::<u32>() {
                let gid = Gid::from_raw(raw);
                match self.group_by_gid(gid).map_err(nss_err)? {
                    Some(group) => {
                        return Ok(RunasLookup { entry: group, unknown_id: false });
                    }
                    None => {
                        let fake = self.make_fake_group(spec, gid);
                        return Ok(RunasLookup { entry: fake, unknown_id: true });
                    }
                }
            }
        }

        match self.group_by_name(spec).map_err(nss_err)? {
            Some(group) => Ok(RunasLookup { entry: group, unknown_id: false }),
            None => Err(InputError::UnknownGroup(spec.to_string()).into()),
        }
    }

    /**
     * All gids the user belongs to, cached per user name.
     */
    pub fn group_list(&self, user: &User) -> io::Result<Rc<Vec<Gid>>> {
        if let Some(hit) = self.group_lists.borrow().get(&user.name) {
            return Ok(hit.clone());
        }

        let list = Rc::new(self.nss.group_list(user)?);
        self.group_lists.borrow_mut().insert(user.name.clone(), list.clone());
        Ok(list)
    }

    /**
     * Check whether `user` belongs to the named group, by gid membership
     * or by appearing in the group's member list.
     */
    pub fn user_in_group(&self, user: &User, gids: &[Gid], group_name: &str) -> bool {
        match self.group_by_name(group_name) {
            Ok(Some(group)) => {
                if gids.contains(&group.gid) || user.gid == group.gid {
                    return true;
                }
                group.members.iter().any(|m| m == &user.name)
            }
            _ => false,
        }
    }

    /**
     * Drop all cached entries. Shared references held elsewhere keep
     * their entries alive until the last holder goes away.
     */
    pub fn clear(&self) {
        self.users_by_name.borrow_mut().clear();
        self.users_by_uid.borrow_mut().clear();
        self.groups_by_name.borrow_mut().clear();
        self.groups_by_gid.borrow_mut().clear();
        self.group_lists.borrow_mut().clear();
    }

    fn remember_user(&self, name: &str, entry: Option<Rc<User>>) {
        if let Some(ref user) = entry {
            self.users_by_uid
                .borrow_mut()
                .entry(user.uid.as_raw())
                .or_insert_with(|| Some(user.clone()));
        }
        self.users_by_name.borrow_mut().insert(name.to_string(), entry);
    }
}

fn nss_err(err: io::Error) -> Error {
    crate::modules::error::ResourceError::Io {
        path: "user database".to_string(),
        err,
    }
    .into()
}

/**
 * In-memory collaborators for test rigs and embedders that bring
 * their own credential data.
 */
pub mod testing {
    use super::*;

    /**
     * In-memory credential database for tests.
     */
    #[derive(Default)]
    pub struct FakeNss {
        pub users: Vec<User>,
        pub groups: Vec<Group>,
        pub memberships: HashMap<String, Vec<u32>>,
    }

    impl FakeNss {
        pub fn with_user(mut self, name: &str, uid: u32, gid: u32) -> Self {
            self.users.push(User {
                name: name.to_string(),
                uid: Uid::from_raw(uid),
                gid: Gid::from_raw(gid),
                home: format!("/home/{name}"),
                shell: "/bin/bash".to_string(),
            });
            self
        }

        pub fn with_group(mut self, name: &str, gid: u32, members: &[&str]) -> Self {
            self.groups.push(Group {
                name: name.to_string(),
                gid: Gid::from_raw(gid),
                members: members.iter().map(|m| m.to_string()).collect(),
            });
            self
        }

        pub fn with_membership(mut self, user: &str, gids: &[u32]) -> Self {
            self.memberships.insert(user.to_string(), gids.to_vec());
            self
        }
    }

    impl NameService for FakeNss {
        fn user_by_name(&self, name: &str) -> io::Result<Option<User>> {
            Ok(self.users.iter().find(|u| u.name == name).cloned())
        }

        fn user_by_uid(&self, uid: Uid) -> io::Result<Option<User>> {
            Ok(self.users.iter().find(|u| u.uid == uid).cloned())
        }

        fn group_by_name(&self, name: &str) -> io::Result<Option<Group>> {
            Ok(self.groups.iter().find(|g| g.name == name).cloned())
        }

        fn group_by_gid(&self, gid: Gid) -> io::Result<Option<Group>> {
            Ok(self.groups.iter().find(|g| g.gid == gid).cloned())
        }

        fn group_list(&self, user: &User) -> io::Result<Vec<Gid>> {
            let mut gids = vec![user.gid];
            if let Some(extra) = self.memberships.get(&user.name) {
                gids.extend(extra.iter().map(|g| Gid::from_raw(*g)));
            }
            Ok(gids)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeNss;
    use super::*;

    fn db() -> UserDb {
        UserDb::new(Box::new(
            FakeNss::default()
                .with_user("alice", 1000, 1000)
                .with_user("root", 0, 0)
                .with_group("wheel", 10, &["alice"])
                .with_group("users", 1000, &[])
                .with_membership("alice", &[10]),
        ))
    }

    #[test]
    fn caches_share_entries() {
        let db = db();
        let a = db.user_by_name("alice").unwrap().unwrap();
        let b = db.user_by_uid(Uid::from_raw(1000)).unwrap().unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn negative_lookups_are_cached() {
        let db = db();
        assert!(db.user_by_name("nobody-here").unwrap().is_none());
        // Second lookup is answered from the cache.
        assert!(db.users_by_name.borrow().contains_key("nobody-here"));
    }

    #[test]
    fn numeric_runas_known_uid() {
        let db = db();
        let hit = db.resolve_runas_user("#1000", Gid::from_raw(1000)).unwrap();
        assert!(!hit.unknown_id);
        assert_eq!(hit.entry.name, "alice");
    }

    #[test]
    fn numeric_runas_unknown_uid_synthesizes() {
        let db = db();
        let hit = db.resolve_runas_user("#4242", Gid::from_raw(1000)).unwrap();
        assert!(hit.unknown_id);
        assert_eq!(hit.entry.name, "#4242");
        assert_eq!(hit.entry.uid.as_raw(), 4242);
    }

    #[test]
    fn malformed_numeric_falls_back_to_name() {
        let db = db();
        let err = db.resolve_runas_user("#12x", Gid::from_raw(0)).unwrap_err();
        assert!(matches!(err, Error::Input(InputError::UnknownUser(_))));
    }

    #[test]
    fn group_membership() {
        let db = db();
        let alice = db.user_by_name("alice").unwrap().unwrap();
        let gids = db.group_list(&alice).unwrap();
        assert!(db.user_in_group(&alice, &gids, "wheel"));
        assert!(!db.user_in_group(&alice, &gids, "missing"));
    }
}
