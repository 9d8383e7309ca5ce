use super::{run_capturing, write_banner, StepError, TaskEnv};
use crate::models::ScriptLang;
use crate::substitution::Constants;
use std::fs;
use std::io::Write;
use std::process::Command;

/// Selects the interpreter for `lang`, per spec.md §4.5:
/// shell->`sh`, batch/bat->host batch, powershell/ps->host shell, python/py->the
/// same interpreter family running this process's scripts.
fn interpreter_command(lang: ScriptLang, script_path: &std::path::Path) -> Command {
    match lang {
        ScriptLang::Shell => {
            let mut cmd = Command::new("sh");
            cmd.arg(script_path);
            cmd
        }
        ScriptLang::Batch => {
            if cfg!(windows) {
                let mut cmd = Command::new("cmd");
                cmd.args(["/C", &script_path.display().to_string()]);
                cmd
            } else {
                let mut cmd = Command::new("sh");
                cmd.arg(script_path);
                cmd
            }
        }
        ScriptLang::PowerShell => {
            if cfg!(windows) {
                let mut cmd = Command::new("cmd");
                cmd.args(["/C", &script_path.display().to_string()]);
                cmd
            } else {
                let mut cmd = Command::new("sh");
                cmd.arg(script_path);
                cmd
            }
        }
        ScriptLang::Python => {
            let program = if cfg!(windows) { "python" } else { "python3" };
            let mut cmd = Command::new(program);
            cmd.arg(script_path);
            cmd
        }
    }
}

pub fn run(
    lang: ScriptLang,
    body: &str,
    env: &TaskEnv,
    constants: &Constants,
    out: &mut dyn Write,
) -> Result<(), StepError> {
    let text = env.substitute(body, constants);
    let script_name = format!("step-{}.{}", env.step_index, lang.extension());
    let script_path = env.workspace.join(&script_name);
    fs::write(&script_path, text)?;

    write_banner(out, "Script", &script_path.display().to_string(), env);

    let mut cmd = interpreter_command(lang, &script_path);
    cmd.current_dir(&env.workspace);

    let (status, combined) = run_capturing(&mut cmd)?;

    let _ = out.write_all(&combined);
    let _ = out.flush();

    if !status.success() {
        return Err(StepError::ScriptFailed(status.code()));
    }
    Ok(())
}
