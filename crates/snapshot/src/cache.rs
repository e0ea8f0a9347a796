//! In-memory module cache.
//!
//! [`MemoryCachedModule`] keeps a complete, pre-rendered view of one
//! module: for every reachable path it holds a recursive and a
//! non-recursive [`FileList`], each entry carrying its contents, checksum,
//! and compressed block. A repository rebuild produces two fresh maps and
//! publishes them by swapping reference-counted handles, so lookups never
//! contend with builds and a session that already resolved a listing keeps
//! serving the snapshot it started with.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};

use tracing::{debug, warn};

use crate::error::NoSuchPath;
use crate::file::{CachedFile, CachedFileBuilder};
use crate::list::{FileList, FileListBuilder};
use crate::repository::{Repository, Watcher};

type PathMap = HashMap<String, Arc<FileList>>;

/// Interface the session layer uses to serve a module.
pub trait Module: Send + Sync {
    /// Logical module name, the first segment of every requested path.
    fn name(&self) -> &str;

    /// Human-readable description for module listings.
    fn description(&self) -> &str;

    /// Looks up the listing for `root_path`.
    ///
    /// # Errors
    ///
    /// [`NoSuchPath`] when the path lies outside the module or has no entry
    /// in the current snapshot.
    fn file_list(&self, root_path: &str, recursive: bool) -> Result<Arc<FileList>, NoSuchPath>;
}

/// A module whose entire content lives in memory.
///
/// Every possible requested path maps to a prebuilt [`FileList`], taking a
/// few hundred to a few thousand bytes each depending on directory sizes.
/// Listings returned from [`Module::file_list`] are immutable; a rebuild
/// makes future calls return new ones.
pub struct MemoryCachedModule {
    name: String,
    description: String,
    recursive_lists: RwLock<Arc<PathMap>>,
    non_recursive_lists: RwLock<Arc<PathMap>>,
    generation: Mutex<u64>,
    rebuilt: Condvar,
}

impl MemoryCachedModule {
    /// Creates the module and registers it as `source`'s watcher.
    ///
    /// `name` is the base of all apparent paths; `description` is free
    /// text shown in module listings.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        source: &dyn Repository,
    ) -> Arc<Self> {
        let module = Arc::new(Self {
            name: name.into(),
            description: description.into(),
            recursive_lists: RwLock::new(Arc::new(PathMap::new())),
            non_recursive_lists: RwLock::new(Arc::new(PathMap::new())),
            generation: Mutex::new(0),
            rebuilt: Condvar::new(),
        });
        source.set_watcher(Arc::clone(&module) as Arc<dyn Watcher>);
        module
    }

    /// Number of snapshots published so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        *self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until at least one snapshot has been published.
    pub fn wait_for_snapshot(&self) {
        let mut generation = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *generation == 0 {
            generation = self
                .rebuilt
                .wait(generation)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn publish(&self, recursive: PathMap, non_recursive: PathMap) {
        *self
            .recursive_lists
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(recursive);
        *self
            .non_recursive_lists
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(non_recursive);
        let mut generation = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *generation += 1;
        self.rebuilt.notify_all();
    }
}

impl Module for MemoryCachedModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn file_list(&self, root_path: &str, recursive: bool) -> Result<Arc<FileList>, NoSuchPath> {
        // A bare module name reads as the module root.
        let rewritten;
        let requested = if root_path == self.name {
            rewritten = format!("{}/", self.name);
            rewritten.as_str()
        } else {
            root_path
        };

        // Everything served must sit under the module's own mount point.
        requested
            .strip_prefix(self.name.as_str())
            .filter(|rest| rest.starts_with('/'))
            .ok_or(NoSuchPath)?;

        let lists = if recursive {
            &self.recursive_lists
        } else {
            &self.non_recursive_lists
        };
        let snapshot = Arc::clone(&lists.read().unwrap_or_else(PoisonError::into_inner));
        snapshot.get(requested).cloned().ok_or(NoSuchPath)
    }
}

impl Watcher for MemoryCachedModule {
    fn repository_updated(&self, repository: &dyn Repository) {
        let root = repository.repository_root();
        let tree = match CachedFileBuilder::new().build(&root) {
            Ok(tree) => tree,
            Err(err) => {
                // The previous snapshot stays authoritative.
                warn!(module = %self.name, error = %err, "snapshot rebuild failed");
                return;
            }
        };

        let mut recursive = PathMap::new();
        let mut non_recursive = PathMap::new();
        populate(&FileListBuilder::new(), &mut recursive, &mut non_recursive, &tree);
        debug!(module = %self.name, paths = recursive.len(), "snapshot published");
        self.publish(recursive, non_recursive);
    }
}

/// Indexes `path` (and, for directories, everything below it) under every
/// key a client may request it as.
fn populate(
    builder: &FileListBuilder,
    recursive: &mut PathMap,
    non_recursive: &mut PathMap,
    path: &Arc<CachedFile>,
) {
    let name = path.name();
    if let Some(at) = name.rfind('/') {
        let root = &name[..at];
        recursive.insert(name.to_owned(), Arc::new(builder.make_list(root, path, true)));
        non_recursive.insert(name.to_owned(), Arc::new(builder.make_list(root, path, false)));
    }
    if let Some(children) = path.children() {
        let key = format!("{name}/");
        recursive.insert(key.clone(), Arc::new(builder.make_list(name, path, true)));
        non_recursive.insert(key, Arc::new(builder.make_list(name, path, false)));
        for child in children {
            populate(builder, recursive, non_recursive, child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Node;

    struct StaticRepository {
        root: Node,
        watcher: Mutex<Option<Arc<dyn Watcher>>>,
    }

    impl StaticRepository {
        fn new(root: Node) -> Self {
            Self {
                root,
                watcher: Mutex::new(None),
            }
        }

        fn trigger(&self) {
            let watcher = self
                .watcher
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(watcher) = watcher {
                watcher.repository_updated(self);
            }
        }
    }

    impl Repository for StaticRepository {
        fn set_watcher(&self, watcher: Arc<dyn Watcher>) {
            *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
        }

        fn repository_root(&self) -> Node {
            self.root.clone()
        }
    }

    fn sample_repository() -> StaticRepository {
        StaticRepository::new(Node::directory(
            "repo",
            0,
            vec![
                Node::directory("repo/sub", 0, vec![Node::file("repo/sub/a", vec![1], 0)]),
                Node::file("repo/top", vec![2], 0),
            ],
        ))
    }

    #[test]
    fn lookups_fail_before_the_first_snapshot() {
        let repository = sample_repository();
        let module = MemoryCachedModule::new("repo", "test module", &repository);
        assert_eq!(module.file_list("repo/", true).unwrap_err(), NoSuchPath);
        assert_eq!(module.generation(), 0);
    }

    #[test]
    fn module_name_is_rewritten_to_the_root_listing() {
        let repository = sample_repository();
        let module = MemoryCachedModule::new("repo", "test module", &repository);
        repository.trigger();

        let by_name = module.file_list("repo", true).unwrap();
        let by_slash = module.file_list("repo/", true).unwrap();
        assert_eq!(by_name.root(), by_slash.root());
        assert_eq!(by_name.len(), by_slash.len());
    }

    #[test]
    fn paths_outside_the_module_are_rejected() {
        let repository = sample_repository();
        let module = MemoryCachedModule::new("repo", "test module", &repository);
        repository.trigger();

        assert_eq!(module.file_list("other/x", true).unwrap_err(), NoSuchPath);
        assert_eq!(module.file_list("repository", true).unwrap_err(), NoSuchPath);
        assert_eq!(module.file_list("repo/missing", true).unwrap_err(), NoSuchPath);
    }

    #[test]
    fn directories_are_reachable_with_and_without_the_slash() {
        let repository = sample_repository();
        let module = MemoryCachedModule::new("repo", "test module", &repository);
        repository.trigger();

        let plain = module.file_list("repo/sub", true).unwrap();
        let slashed = module.file_list("repo/sub/", true).unwrap();
        assert_eq!(plain.root(), "repo", "the plain key roots at the parent");
        assert_eq!(slashed.root(), "repo/sub", "the slashed key roots at itself");
    }

    #[test]
    fn every_recursive_key_has_a_non_recursive_twin() {
        let repository = sample_repository();
        let module = MemoryCachedModule::new("repo", "test module", &repository);
        repository.trigger();

        for path in ["repo/", "repo/sub", "repo/sub/", "repo/sub/a", "repo/top"] {
            let recursive = module.file_list(path, true).unwrap();
            let non_recursive = module.file_list(path, false).unwrap();
            assert_eq!(recursive.root(), non_recursive.root(), "roots differ for {path}");
        }
    }

    #[test]
    fn name_and_description_pass_through() {
        let repository = sample_repository();
        let module = MemoryCachedModule::new("repo", "an RPKI publication point", &repository);
        assert_eq!(module.name(), "repo");
        assert_eq!(module.description(), "an RPKI publication point");
    }
}
