// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host-tool invocation: run a command, stream stdout lines to a callback,
//! return the exit code.  Used for the symbol extractor and the line
//! decoders, both of which are optional tools that may be missing.

use anyhow::Context;
use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};

/// Runs `program` with `args`, feeding each stdout line (without the
/// trailing newline) to `on_line`.  Stderr is discarded.
pub fn exec_lines<F>(program: &str, args: &[String], mut on_line: F) -> anyhow::Result<i32>
where
    F: FnMut(&str),
{
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Unable to start process: {program}"))?;

    let stdout = child.stdout.take().context("Child had no stdout")?;
    for line in BufReader::new(stdout).lines() {
        let line = line?;
        on_line(&line);
    }
    let status = child.wait()?;
    Ok(status.code().unwrap_or(-1))
}

/// Same contract, but the command goes through the shell.  Needed when the
/// tool chain is a pipe (`nm ... | c++filt`).
pub fn exec_shell_lines<F>(command: &str, on_line: F) -> anyhow::Result<i32>
where
    F: FnMut(&str),
{
    exec_lines("sh", &["-c".to_string(), command.to_string()], on_line)
}
