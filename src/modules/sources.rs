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
 * Ordered rule sources.
 *
 * A rule source knows how to open itself, produce a parse tree, hand out
 * its settings entries and close again; the list preserves the order the
 * platform configuration names them in. A source that can neither open
 * nor parse is dropped from the list with a warning. If every source
 * drops, the request fails.
 *
 * All source I/O runs with the privilege gate holding the policy-reader
 * or root identity; the caller is responsible for that bracket.
 */

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::MetadataExt;

use tracing::warn;

use crate::modules::error::{Error, PolicyError};
use crate::modules::rules::{DefaultsEntry, ParseTree};

/**
 * One provider of rules and settings entries.
 */
pub trait RuleSource {
    fn open(&mut self) -> Result<(), Error>;
    fn parse(&mut self) -> Result<(), Error>;
    fn get_defaults(&self) -> Result<&[DefaultsEntry], Error>;
    fn close(&mut self);

    /**
     * Human-readable origin used in citations and diagnostics.
     */
    fn source(&self) -> &str;

    /**
     * The tree produced by `parse`, if any.
     */
    fn tree(&self) -> Option<&ParseTree>;
}

/**
 * The external grammar parser. Trees arrive fully resolved; aliases and
 * include directives are the parser's business.
 */
pub trait ParseEngine {
    fn parse(&self, text: &str, file: &str) -> Result<ParseTree, PolicyError>;
}

/**
 * Expected ownership of an on-disk policy file.
 */
#[derive(Debug, Clone, Copy)]
pub struct FileOwner {
    pub uid: u32,
    pub gid: u32,
}

/**
 * A policy file on disk. The file discipline is enforced on open: it
 * must be a regular file, owned by the configured uid, not world
 * writable, and group writable only by the configured gid.
 */
pub struct FileSource {
    path: String,
    owner: FileOwner,
    parser: Box<dyn ParseEngine>,
    file: Option<File>,
    tree: Option<ParseTree>,
}

impl FileSource {
    pub fn new(path: &str, owner: FileOwner, parser: Box<dyn ParseEngine>) -> FileSource {
        FileSource {
            path: path.to_string(),
            owner,
            parser,
            file: None,
            tree: None,
        }
    }

    fn secure_open(&self) -> Result<File, PolicyError> {
        let file = File::open(&self.path).map_err(|err| PolicyError::SourceOpen {
            path: self.path.clone(),
            err,
        })?;

        let meta = file.metadata().map_err(|err| PolicyError::SourceOpen {
            path: self.path.clone(),
            err,
        })?;

        if !meta.file_type().is_file() {
            return Err(PolicyError::SourceBadType(self.path.clone()));
        }
        if meta.uid() != self.owner.uid {
            return Err(PolicyError::SourceWrongOwner {
                path: self.path.clone(),
                actual: meta.uid(),
                wanted: self.owner.uid,
            });
        }
        if meta.mode() & 0o002 != 0 {
            return Err(PolicyError::SourceWorldWritable(self.path.clone()));
        }
        if meta.mode() & 0o020 != 0 && meta.gid() != self.owner.gid {
            return Err(PolicyError::SourceGroupWritable {
                path: self.path.clone(),
                actual: meta.gid(),
                wanted: self.owner.gid,
            });
        }

        Ok(file)
    }
}

impl RuleSource for FileSource {
    fn open(&mut self) -> Result<(), Error> {
        self.file = Some(self.secure_open()?);
        Ok(())
    }

    fn parse(&mut self) -> Result<(), Error> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| PolicyError::SourceParse {
                path: self.path.clone(),
                reason: "source is not open".to_string(),
            })?;

        let mut text = String::new();
        file.read_to_string(&mut text)
            .map_err(|err| PolicyError::SourceOpen {
                path: self.path.clone(),
                err,
            })?;

        self.tree = Some(self.parser.parse(&text, &self.path)?);
        Ok(())
    }

    fn get_defaults(&self) -> Result<&[DefaultsEntry], Error> {
        match self.tree {
            Some(ref tree) => Ok(&tree.defaults),
            None => Err(PolicyError::SourceParse {
                path: self.path.clone(),
                reason: "no parse tree".to_string(),
            }
            .into()),
        }
    }

    fn close(&mut self) {
        // The parsed tree survives for re-entrant requests; only the
        // descriptor is released.
        self.file = None;
    }

    fn source(&self) -> &str {
        &self.path
    }

    fn tree(&self) -> Option<&ParseTree> {
        self.tree.as_ref()
    }
}

/**
 * An in-memory source, for embedders that hold their rules elsewhere
 * and for tests.
 */
pub struct StaticSource {
    name: String,
    tree: ParseTree,
}

impl StaticSource {
    pub fn new(name: &str, tree: ParseTree) -> StaticSource {
        StaticSource {
            name: name.to_string(),
            tree,
        }
    }
}

impl RuleSource for StaticSource {
    fn open(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn parse(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn get_defaults(&self) -> Result<&[DefaultsEntry], Error> {
        Ok(&self.tree.defaults)
    }

    fn close(&mut self) {}

    fn source(&self) -> &str {
        &self.name
    }

    fn tree(&self) -> Option<&ParseTree> {
        Some(&self.tree)
    }
}

/**
 * The ordered source list.
 */
#[derive(Default)]
pub struct SourceList {
    sources: Vec<Box<dyn RuleSource>>,
}

impl SourceList {
    pub fn new(sources: Vec<Box<dyn RuleSource>>) -> SourceList {
        SourceList { sources }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Box<dyn RuleSource>> {
        self.sources.iter()
    }

    /**
     * Open and parse every source, dropping the ones that fail either
     * step. Errors if no source survives.
     */
    pub fn open_all(&mut self) -> Result<usize, Error> {
        self.sources.retain_mut(|source| {
            if let Err(err) = source.open() {
                warn!(source = source.source(), %err, "dropping rule source");
                return false;
            }
            if let Err(err) = source.parse() {
                warn!(source = source.source(), %err, "dropping rule source");
                return false;
            }
            true
        });

        if self.sources.is_empty() {
            return Err(PolicyError::NoSources.into());
        }
        Ok(self.sources.len())
    }

    pub fn close_all(&mut self) {
        for source in &mut self.sources {
            source.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::rules::{DefaultsEntry, Origin};
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    struct NullParser;

    impl ParseEngine for NullParser {
        fn parse(&self, _text: &str, _file: &str) -> Result<ParseTree, PolicyError> {
            Ok(ParseTree::default())
        }
    }

    struct FailingSource;

    impl RuleSource for FailingSource {
        fn open(&mut self) -> Result<(), Error> {
            Err(PolicyError::SourceOpen {
                path: "nowhere".to_string(),
                err: std::io::Error::from(std::io::ErrorKind::NotFound),
            }
            .into())
        }

        fn parse(&mut self) -> Result<(), Error> {
            unreachable!("open never succeeds")
        }

        fn get_defaults(&self) -> Result<&[DefaultsEntry], Error> {
            Ok(&[])
        }

        fn close(&mut self) {}

        fn source(&self) -> &str {
            "nowhere"
        }

        fn tree(&self) -> Option<&ParseTree> {
            None
        }
    }

    fn me() -> FileOwner {
        FileOwner {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }

    #[test]
    fn failing_sources_are_dropped_not_fatal() {
        let tree = ParseTree {
            defaults: vec![DefaultsEntry::flag("requiretty", true, Origin::new("static", 1, 1))],
            userspecs: Vec::new(),
        };

        let mut list = SourceList::new(vec![
            Box::new(FailingSource),
            Box::new(StaticSource::new("static", tree)),
        ]);

        assert_eq!(list.open_all().unwrap(), 1);
        assert_eq!(list.iter().next().unwrap().source(), "static");
    }

    #[test]
    fn all_sources_failing_is_an_error() {
        let mut list = SourceList::new(vec![Box::new(FailingSource)]);
        let err = list.open_all().unwrap_err();
        assert!(matches!(err, Error::Policy(PolicyError::NoSources)));
    }

    #[test]
    fn file_source_rejects_world_writable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "# empty").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666)).unwrap();

        let mut source = FileSource::new(path.to_str().unwrap(), me(), Box::new(NullParser));
        let err = source.open().unwrap_err();
        assert!(matches!(err, Error::Policy(PolicyError::SourceWorldWritable(_))));
    }

    #[test]
    fn file_source_rejects_wrong_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules");
        File::create(&path).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o440)).unwrap();

        let owner = FileOwner { uid: me().uid.wrapping_add(1), gid: me().gid };
        let mut source = FileSource::new(path.to_str().unwrap(), owner, Box::new(NullParser));
        let err = source.open().unwrap_err();
        assert!(matches!(err, Error::Policy(PolicyError::SourceWrongOwner { .. })));
    }

    #[test]
    fn file_source_parses_and_keeps_tree_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "# empty").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o440)).unwrap();

        let mut source = FileSource::new(path.to_str().unwrap(), me(), Box::new(NullParser));
        source.open().unwrap();
        source.parse().unwrap();
        source.close();

        assert!(source.tree().is_some());
        assert!(source.get_defaults().unwrap().is_empty());
    }
}
