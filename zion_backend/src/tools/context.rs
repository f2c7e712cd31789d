//! `focus_file` / `unfocus_file`: manage the files pinned into every prompt.

use anyhow::Result;
use serde::Deserialize;

use super::ToolContext;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PathArgs {
    #[serde(alias = "file_path")]
    pub path: String,
}

pub fn focus_file(args: &PathArgs, ctx: &ToolContext) -> Result<String> {
    let path = ctx.resolve(&args.path);
    let mut focus = ctx.lock_focus()?;
    Ok(focus.add(&path))
}

pub fn unfocus_file(args: &PathArgs, ctx: &ToolContext) -> Result<String> {
    let path = ctx.resolve(&args.path);
    let mut focus = ctx.lock_focus()?;
    Ok(focus.remove(&path))
}
