//! Tree registry: named root directories tagged SRC/INC/OUT,
//! with containment tests and absolute/relative path conversion.

use std::path::{Path, PathBuf};
use strum::{Display, EnumIs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIs)]
pub enum TreeKind {
    Src,
    Inc,
    Out,
}

#[derive(Debug, Clone)]
pub struct Tree {
    pub kind: TreeKind,
    pub root: PathBuf,
}

impl Tree {
    pub fn new(kind: TreeKind, root: PathBuf) -> Self {
        debug_assert!(root.is_absolute(), "tree roots must be absolute");
        Self { kind, root }
    }

    pub fn contains_abs(&self, abs: &Path) -> bool {
        abs.starts_with(&self.root)
    }

    /// Whether `rel` names a path that exists under this tree.
    pub fn contains_rel(&self, rel: &Path) -> bool {
        self.root.join(rel).exists()
    }

    pub fn abs_path(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }

    /// Precondition: `abs` is contained in this tree.
    pub fn rel_path(&self, abs: &Path) -> PathBuf {
        abs.strip_prefix(&self.root)
            .expect("rel_path called on a path outside this tree")
            .to_path_buf()
    }
}

/// The SRC/INC*/OUT registry, consulted in precedence order: SRC, then
/// each INC in declared order, then OUT as the implicit fallback for
/// files that must still be produced.
pub struct TreeRegistry {
    pub src: Tree,
    pub inc: Vec<Tree>,
    pub out: Tree,
}

impl TreeRegistry {
    pub fn new(src: Tree, inc: Vec<Tree>, out: Tree) -> Self {
        debug_assert!(src.kind.is_src());
        debug_assert!(inc.iter().all(|t| t.kind.is_inc()));
        debug_assert!(out.kind.is_out());
        Self { src, inc, out }
    }

    fn search_order(&self) -> impl Iterator<Item = &Tree> {
        std::iter::once(&self.src)
            .chain(self.inc.iter())
            .chain(std::iter::once(&self.out))
    }

    /// First tree (in precedence order) containing `abs` as an existing
    /// path, or `None` if no tree contains it at all (not even as a
    /// hypothetical child).
    pub fn find_containing_abs(&self, abs: &Path) -> Option<&Tree> {
        self.search_order().find(|t| t.contains_abs(abs))
    }

    /// First tree in which `rel` exists as a file, searched SRC, INC*,
    /// OUT. Unlike [`Self::try_find_tree`], returns `None` rather than
    /// falling back to OUT — used by target resolution, where "no tree
    /// contains this" is meant to surface as an error.
    pub fn find_tree(&self, rel: &Path) -> Option<&Tree> {
        self.search_order().find(|t| t.contains_rel(rel))
    }

    /// Same search, but always succeeds: files that don't yet exist
    /// anywhere are assumed to belong in OUT, since that's the only tree
    /// jhm is allowed to write to.
    pub fn try_find_tree(&self, rel: &Path) -> &Tree {
        self.find_tree(rel).unwrap_or(&self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(dir: &Path) -> TreeRegistry {
        TreeRegistry::new(
            Tree::new(TreeKind::Src, dir.join("src")),
            vec![Tree::new(TreeKind::Inc, dir.join("inc"))],
            Tree::new(TreeKind::Out, dir.join("out")),
        )
    }

    #[test]
    fn try_find_tree_falls_back_to_out() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("out")).unwrap();
        let r = reg(dir.path());
        let t = r.try_find_tree(Path::new("generated/foo.o"));
        assert!(t.kind.is_out());
    }

    #[test]
    fn find_tree_prefers_src_over_inc_over_out() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/a")).unwrap();
        std::fs::write(dir.path().join("src/a/x.c"), "").unwrap();
        let r = reg(dir.path());
        let t = r.find_tree(Path::new("a/x.c")).unwrap();
        assert!(t.kind.is_src());
    }
}
