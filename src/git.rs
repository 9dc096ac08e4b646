use std::path::{Path, PathBuf};

use git2::{ErrorCode, IndexAddOption, Repository, Signature};

use crate::orchestration::Committer;
use crate::{blog_debug, Result};

/// git2-backed committer for the repository containing `repo_path`.
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        blog_debug!("GitOps::new path={}", repo_path.display());
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    /// Stage exactly `files` (additions, modifications and deletions) and
    /// commit them on HEAD. Returns `None` when the tree did not change.
    pub fn commit_paths(&self, files: &[String], message: &str) -> Result<Option<String>> {
        blog_debug!(
            "GitOps::commit_paths files={:?} message={}",
            files,
            message.lines().next().unwrap_or("")
        );
        // An empty pathspec would match the whole tree.
        if files.is_empty() {
            return Ok(None);
        }
        let repo = self.repo()?;
        let mut index = repo.index()?;
        let specs: Vec<&str> = files.iter().map(String::as_str).collect();
        index.add_all(specs.iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(specs.iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
                None
            }
            Err(e) => return Err(e.into()),
        };
        if parent.as_ref().is_some_and(|p| p.tree_id() == tree_id) {
            blog_debug!("Nothing to commit");
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("Baton", "baton@localhost"))?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        blog_debug!("Commit created: {}", commit_id);
        Ok(Some(commit_id.to_string()))
    }
}

impl Committer for GitOps {
    fn commit(&self, files: &[String], message: &str) -> Result<Option<String>> {
        self.commit_paths(files, message)
    }
}
