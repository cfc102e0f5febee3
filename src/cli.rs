use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sysgate")]
#[command(about = "Run a command under syscall interception and policy enforcement")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Trace a command, deciding every syscall it makes
    Run(RunArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Command to execute under the tracer
    #[arg(required = true, trailing_var_arg = true)]
    pub command: Vec<String>,

    /// Deny a syscall with an errno, e.g. --deny connect=13 (repeatable)
    #[arg(long, value_name = "SYSCALL=ERRNO")]
    pub deny: Vec<String>,

    /// Detach the tracer into its own session
    #[arg(long)]
    pub background: bool,

    /// JSONL output file (default: stdout)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

impl RunArgs {
    pub fn deny_rules(&self) -> anyhow::Result<Vec<(String, i32)>> {
        self.deny
            .iter()
            .map(|spec| {
                let (name, errno) = spec
                    .split_once('=')
                    .with_context(|| format!("invalid deny rule '{}', expected SYSCALL=ERRNO", spec))?;
                let errno: i32 = errno
                    .parse()
                    .with_context(|| format!("invalid errno in deny rule '{}'", spec))?;
                if errno <= 0 {
                    anyhow::bail!("errno in deny rule '{}' must be positive", spec);
                }
                Ok((name.to_string(), errno))
            })
            .collect()
    }
}
