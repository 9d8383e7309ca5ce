use super::{run_capturing, write_banner, StepError, TaskEnv};
use crate::substitution::Constants;
use std::io::Write;
use std::process::Command;

pub fn run(
    command_line: &str,
    env: &TaskEnv,
    constants: &Constants,
    out: &mut dyn Write,
) -> Result<(), StepError> {
    let target = env.substitute(command_line, constants);
    write_banner(out, "Exec", &target, env);

    let mut parts = target.split_whitespace();
    let program = parts.next().ok_or(StepError::EmptyExecTarget)?;

    let mut cmd = Command::new(program);
    cmd.args(parts).current_dir(&env.workspace);

    let (status, combined) = run_capturing(&mut cmd)?;

    let _ = out.write_all(&combined);
    let _ = out.flush();

    if !status.success() {
        return Err(StepError::ExecFailed(status.code()));
    }
    Ok(())
}
