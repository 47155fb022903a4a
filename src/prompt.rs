//! Prompt templates behind an injected adapter, so callers (and tests) can
//! swap the wording without touching the engine.

use crate::ai::backend::PromptPair;

pub trait PromptSource: Send + Sync {
    fn file_prompts(&self, relative_path: &str, structure: Option<&str>) -> PromptPair;
    fn directory_prompts(&self, relative_dir: &str, structure: Option<&str>) -> PromptPair;
    fn root_prompts(&self, target: &str, structure: Option<&str>) -> PromptPair;
}

/// Built-in templates. The user half of each pair is a preamble; the
/// pipeline appends the actual context documents (source bytes, child
/// summaries, aggregate bodies) beneath it at execution time.
pub struct DefaultPrompts;

const FILE_SYSTEM: &str = "You are a senior engineer writing terse, factual \
documentation for other engineers and for AI coding assistants. Describe what \
the code does and how it fits into the project. Never speculate, never pad. \
Start with a one-line purpose sentence prefixed 'PURPOSE: '. If the file \
contains TODO/FIXME comments that matter, list up to three under \
'CRITICAL-TODOS:'. If the file is tightly coupled to specific sibling files, \
list them under 'RELATED-FILES:'.";

const DIRECTORY_SYSTEM: &str = "You are a senior engineer writing a short \
directory overview from the per-file summaries and subdirectory overviews \
provided. Explain the directory's role, its key files, and how the pieces \
interact. Do not repeat file summaries verbatim; synthesize.";

const ROOT_SYSTEM: &str = "You are writing the top-level orientation document \
for an AI coding assistant working in this repository. Synthesize the \
directory overviews provided into: what the project does, how the tree is \
organized, where the important entry points live, and project conventions \
worth following. Be concrete and brief.";

impl PromptSource for DefaultPrompts {
    fn file_prompts(&self, relative_path: &str, structure: Option<&str>) -> PromptPair {
        let mut user = String::new();
        if let Some(structure) = structure {
            user.push_str("Project structure:\n");
            user.push_str(structure);
            user.push_str("\n\n");
        }
        user.push_str(&format!(
            "Summarize the file `{}`. Its content follows.\n",
            relative_path
        ));
        PromptPair {
            system: FILE_SYSTEM.to_string(),
            user,
        }
    }

    fn directory_prompts(&self, relative_dir: &str, structure: Option<&str>) -> PromptPair {
        let mut user = String::new();
        if let Some(structure) = structure {
            user.push_str("Project structure:\n");
            user.push_str(structure);
            user.push_str("\n\n");
        }
        user.push_str(&format!(
            "Write the overview for the directory `{}`. The summaries of its \
             files and subdirectories follow.\n",
            relative_dir
        ));
        PromptPair {
            system: DIRECTORY_SYSTEM.to_string(),
            user,
        }
    }

    fn root_prompts(&self, target: &str, structure: Option<&str>) -> PromptPair {
        let mut user = String::new();
        if let Some(structure) = structure {
            user.push_str("Project structure:\n");
            user.push_str(structure);
            user.push_str("\n\n");
        }
        user.push_str(&format!(
            "Write the project-wide orientation document for the `{}` \
             assistant family. The directory overviews follow.\n",
            target
        ));
        PromptPair {
            system: ROOT_SYSTEM.to_string(),
            user,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_prompt_names_the_file() {
        let pair = DefaultPrompts.file_prompts("src/a.kt", None);
        assert!(pair.user.contains("src/a.kt"));
        assert!(pair.system.contains("PURPOSE"));
    }

    #[test]
    fn structure_is_prepended_when_present() {
        let pair = DefaultPrompts.directory_prompts("src", Some("src/\n  a.kt"));
        assert!(pair.user.starts_with("Project structure:"));
    }
}
