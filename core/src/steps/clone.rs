use super::{write_banner, StepError, TaskEnv};
use crate::git::{self, Repo};
use crate::substitution::Constants;
use std::io::Write;

pub fn run(
    url: &str,
    branch: &str,
    env: &TaskEnv,
    constants: &Constants,
    out: &mut dyn Write,
) -> Result<(), StepError> {
    let url = env.substitute(url, constants);
    let branch = env.substitute(branch, constants);
    let path = env.workspace.join(git::repo_name(&url));

    write_banner(out, "Clone", &format!("{url} {branch}"), env);

    let repo = Repo::new(url, branch, path);
    git::clone_or_pull(&repo, out)?;
    Ok(())
}
