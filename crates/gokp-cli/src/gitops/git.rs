//! Local clone operations with git2

use std::path::{Path, PathBuf};

use git2::{
    Cred, CredentialType, IndexAddOption, PushOptions, RemoteCallbacks, Repository,
    RepositoryInitOptions, Signature,
};
use tracing::debug;

use gokp_common::{Error, Result};

use super::DEFAULT_BRANCH;

const PUSH_REFSPEC: &str = "refs/heads/main:refs/heads/main";

fn git_err(context: &str, err: git2::Error) -> Error {
    Error::transport(format!("git {}", context), err.message().to_string())
}

fn local_err(path: &Path, err: git2::Error) -> Error {
    Error::resource(path, format!("git: {}", err.message()))
}

/// Credentials for pushing to the remote
#[derive(Clone)]
pub enum PushAuth {
    /// HTTPS with a personal access token
    Token(String),
    /// SSH with a private key file
    SshKey(PathBuf),
    /// No credentials, for local remotes
    None,
}

impl std::fmt::Debug for PushAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushAuth::Token(_) => f.write_str("Token(<redacted>)"),
            PushAuth::SshKey(path) => f.debug_tuple("SshKey").field(path).finish(),
            PushAuth::None => f.write_str("None"),
        }
    }
}

impl PushAuth {
    /// Token authentication
    pub fn token(token: impl Into<String>) -> Self {
        PushAuth::Token(token.into())
    }

    fn callbacks(&self) -> RemoteCallbacks<'_> {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |_url, username_from_url, allowed_types| match self {
            PushAuth::SshKey(key) if allowed_types.contains(CredentialType::SSH_KEY) => {
                Cred::ssh_key(username_from_url.unwrap_or("git"), None, key, None)
            }
            PushAuth::Token(token) if allowed_types.contains(CredentialType::USER_PASS_PLAINTEXT) => {
                Cred::userpass_plaintext(username_from_url.unwrap_or("x-access-token"), token)
            }
            _ => Cred::default(),
        });
        callbacks
    }
}

/// Create a repository at `path` on branch `main` with `origin` set to `remote_url`
pub fn init_repository(path: &Path, remote_url: &str) -> Result<()> {
    let mut opts = RepositoryInitOptions::new();
    opts.initial_head(DEFAULT_BRANCH);

    let repo = Repository::init_opts(path, &opts).map_err(|e| local_err(path, e))?;
    repo.remote("origin", remote_url)
        .map_err(|e| local_err(path, e))?;

    debug!(path = %path.display(), remote = %remote_url, "Initialised repository");
    Ok(())
}

/// Stage every change, deletions included, and commit on HEAD.
///
/// A commit is created even when nothing changed.
pub fn commit_all(path: &Path, message: &str) -> Result<git2::Oid> {
    let repo = Repository::open(path).map_err(|e| local_err(path, e))?;

    let mut index = repo.index().map_err(|e| local_err(path, e))?;
    index
        .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
        .map_err(|e| local_err(path, e))?;
    index
        .update_all(["*"].iter(), None)
        .map_err(|e| local_err(path, e))?;
    index.write().map_err(|e| local_err(path, e))?;

    let tree_id = index.write_tree().map_err(|e| local_err(path, e))?;
    let tree = repo.find_tree(tree_id).map_err(|e| local_err(path, e))?;

    let signature = repo
        .signature()
        .or_else(|_| Signature::now("gokp", "gokp@localhost"))
        .map_err(|e| local_err(path, e))?;

    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit().map_err(|e| local_err(path, e))?),
        Err(e) if e.code() == git2::ErrorCode::UnbornBranch || e.code() == git2::ErrorCode::NotFound => None,
        Err(e) => return Err(local_err(path, e)),
    };
    let parents: Vec<&git2::Commit> = parent.iter().collect();

    let oid = repo
        .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
        .map_err(|e| local_err(path, e))?;

    debug!(commit = %oid, message = %message, "Committed");
    Ok(oid)
}

/// Push `main` to `origin`. Never forces.
pub fn push(path: &Path, auth: &PushAuth) -> Result<()> {
    let repo = Repository::open(path).map_err(|e| local_err(path, e))?;
    let mut remote = repo
        .find_remote("origin")
        .map_err(|e| local_err(path, e))?;

    let mut rejection: Option<String> = None;
    {
        let mut callbacks = auth.callbacks();
        callbacks.push_update_reference(|refname, status| {
            if let Some(message) = status {
                rejection = Some(format!("{} rejected: {}", refname, message));
            }
            Ok(())
        });

        let mut opts = PushOptions::new();
        opts.remote_callbacks(callbacks);
        remote
            .push(&[PUSH_REFSPEC], Some(&mut opts))
            .map_err(|e| git_err("push", e))?;
    }

    if let Some(message) = rejection {
        return Err(Error::transport("git push", message));
    }
    Ok(())
}
