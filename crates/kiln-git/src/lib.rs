//! # kiln-git
//!
//! Git integration layer for Kiln.
//!
//! - [`GitExecutor`]: the seam every git invocation goes through (mockable)
//! - [`WorkspaceManager`]: clone-or-refresh a checkout and acquire the task branch
//! - [`HostingService`]: open pull requests on the hosting service (GitHub)
//! - [`RepoRef`]: owner/name parsing and credential handling for repository URLs

mod command;
mod hosting;
mod remote;
mod workspace;

pub use command::{GitCommand, GitExecutor, GitOutput, MockGitExecutor};
pub use hosting::{GitHubClient, HostingService, MockHostingService, PullRequestRequest};
pub use remote::{authenticated_url, redact, RepoRef};
pub use workspace::{validate_branch_name, WorkspaceManager};
