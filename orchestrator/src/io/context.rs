//! Step context rendering for worker requests.
//!
//! The template marks each section `required` or `droppable`; when the rendered
//! context exceeds the byte budget, droppable sections go first and the last
//! remaining section is truncated.

use minijinja::{Environment, context};
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::io::dispatch::ToolFeedback;

const STEP_CONTEXT_TEMPLATE: &str = include_str!("templates/step_context.md");

const DROP_ORDER: [&str; 3] = ["previous", "feedback", "gate"];

const TRUNCATION_MARKER: &str = "\n[truncated]";

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("step context template: {0}")]
    Template(#[from] minijinja::Error),
    #[error("section marker pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Everything the worker sees for one step.
#[derive(Debug, Clone, Default)]
pub struct StepContextInputs<'a> {
    pub task_id: &'a str,
    pub agent_id: &'a str,
    pub step_index: u32,
    pub input: &'a str,
    pub previous_output: Option<&'a str>,
    pub feedback: Option<&'a ToolFeedback>,
    pub gate_failure: Option<&'a str>,
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

pub struct StepContextBuilder {
    env: Environment<'static>,
    marker: Regex,
    budget_bytes: usize,
}

impl std::fmt::Debug for StepContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContextBuilder")
            .field("budget_bytes", &self.budget_bytes)
            .finish_non_exhaustive()
    }
}

impl StepContextBuilder {
    pub fn new(budget_bytes: usize) -> Result<Self, ContextError> {
        let mut env = Environment::new();
        env.add_template("step_context", STEP_CONTEXT_TEMPLATE)?;
        let marker = Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")?;
        Ok(Self {
            env,
            marker,
            budget_bytes,
        })
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    pub fn render(&self, inputs: &StepContextInputs<'_>) -> Result<String, ContextError> {
        let template = self.env.get_template("step_context")?;
        let rendered = template.render(context! {
            task_id => inputs.task_id,
            agent_id => inputs.agent_id,
            step_index => inputs.step_index,
            input => inputs.input.trim(),
            previous_output => non_empty(inputs.previous_output),
            feedback => inputs.feedback.map(describe_feedback),
            gate_failure => non_empty(inputs.gate_failure),
        })?;

        let mut sections = self.parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }

    fn parse_sections(&self, rendered: &str) -> Vec<Section> {
        let markers: Vec<_> = self.marker.captures_iter(rendered).collect();
        let mut sections = Vec::with_capacity(markers.len());
        for (i, caps) in markers.iter().enumerate() {
            let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            let end = markers
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map_or(rendered.len(), |m| m.start());
            let required = kind.as_str() == "required";
            let content = rendered[whole.end()..end].trim().to_string();
            if !content.is_empty() || required {
                sections.push(Section {
                    key: key.as_str().to_string(),
                    required,
                    content,
                });
            }
        }
        sections
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

fn describe_feedback(feedback: &ToolFeedback) -> String {
    let describe = |call: &crate::core::types::ToolCall| match &call.path {
        Some(path) => format!("`{}` / `{}` on `{path}`", call.tool, call.action),
        None => format!("`{}` / `{}`", call.tool, call.action),
    };
    match feedback {
        ToolFeedback::Applied { tool_call } => format!("Applied: {}", describe(tool_call)),
        ToolFeedback::Denied { tool_call, reason } => {
            format!("Denied: {} ({reason}). Choose a different approach.", describe(tool_call))
        }
    }
}

fn total_len(sections: &[Section]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            let dropped = sections.remove(idx);
            debug!(
                section = key,
                bytes_dropped = dropped.content.len(),
                "dropped section for budget"
            );
        }
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    let Some(last) = sections.last_mut() else {
        return;
    };
    let other_len = total - last.content.len();
    let allowed = budget.saturating_sub(other_len);
    let before_len = last.content.len();
    if allowed > TRUNCATION_MARKER.len() {
        truncate_at_boundary(&mut last.content, allowed - TRUNCATION_MARKER.len());
        last.content.push_str(TRUNCATION_MARKER);
    } else {
        truncate_at_boundary(&mut last.content, allowed);
    }
    debug!(
        section = last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

fn truncate_at_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}
