use async_trait::async_trait;
use foreman_core::intervention::{
    InterventionAction, InterventionChannel, InterventionRequest, RiskLevel,
};
use foreman_core::{ForemanError, ForemanResult};

/// Intervention channel that prompts the operator on stderr and reads the
/// answer from stdin.
///
/// The caller bounds the wait with its own deadline; an unanswered prompt
/// falls back to the configured default action.
pub struct StdinInterventionChannel {
    default_action: InterventionAction,
}

impl StdinInterventionChannel {
    pub fn new(default_action: InterventionAction) -> Self {
        Self { default_action }
    }
}

/// Format the prompt with ANSI colors.
pub fn format_intervention_prompt(
    request: &InterventionRequest,
    default_action: InterventionAction,
) -> String {
    let (color, label) = risk_level_style(request.risk_level);

    let mut prompt = String::new();
    prompt.push_str("\n\x1b[1;37m╔══ INTERVENTION NEEDED ══╗\x1b[0m\n");
    prompt.push_str(&format!("  Task:  {}\n", request.task_id));
    prompt.push_str(&format!("  Risk:  \x1b[{color}m{label}\x1b[0m\n"));
    prompt.push_str(&format!("  What:  {}\n", request.summary));
    if !request.context.is_empty() {
        prompt.push_str(&format!("  Error: {}\n", request.context));
    }
    prompt.push_str("\x1b[1;37m╚═════════════════════════╝\x1b[0m\n");
    prompt.push_str(&format!("  [r]etry / [s]kip / [h]alt (default {default_action}): "));
    prompt
}

/// (ANSI color code, label) for a risk level.
pub fn risk_level_style(level: RiskLevel) -> (&'static str, &'static str) {
    match level {
        RiskLevel::Low => ("32", "LOW"),
        RiskLevel::Medium => ("36", "MEDIUM"),
        RiskLevel::High => ("33", "HIGH"),
        RiskLevel::Critical => ("1;31", "CRITICAL"),
    }
}

/// An empty answer picks the default; anything unrecognized is an error.
pub fn parse_intervention_input(
    input: &str,
    default_action: InterventionAction,
) -> ForemanResult<InterventionAction> {
    if input.trim().is_empty() {
        return Ok(default_action);
    }
    InterventionAction::parse(input).ok_or_else(|| {
        ForemanError::Orchestrator(format!("unrecognized answer '{}'", input.trim()))
    })
}

#[async_trait]
impl InterventionChannel for StdinInterventionChannel {
    async fn request_intervention(
        &self,
        request: InterventionRequest,
    ) -> ForemanResult<InterventionAction> {
        eprint!("{}", format_intervention_prompt(&request, self.default_action));

        let input = tokio::task::spawn_blocking(|| {
            let mut input = String::new();
            std::io::stdin().read_line(&mut input).map(|_| input)
        })
        .await
        .map_err(|e| ForemanError::Orchestrator(format!("stdin reader failed: {e}")))??;

        let action = parse_intervention_input(&input, self.default_action)?;
        eprintln!("  → {action}\n");
        Ok(action)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_contents() {
        let request = InterventionRequest::new("T3", "Task 'Add parser' hit a RECOVERABLE error", RiskLevel::Medium)
            .with_context("VCS error: merge conflict in src/lib.rs");
        let prompt = format_intervention_prompt(&request, InterventionAction::Skip);
        assert!(prompt.contains("T3"));
        assert!(prompt.contains("MEDIUM"));
        assert!(prompt.contains("merge conflict"));
        assert!(prompt.contains("default skip"));
    }

    #[test]
    fn test_prompt_without_context() {
        let request = InterventionRequest::new("T1", "timeout", RiskLevel::Low);
        let prompt = format_intervention_prompt(&request, InterventionAction::Halt);
        assert!(!prompt.contains("Error:"));
        assert!(prompt.contains("32"));
    }

    #[test]
    fn test_parse_input() {
        let skip = InterventionAction::Skip;
        assert_eq!(parse_intervention_input("r\n", skip).unwrap(), InterventionAction::Retry);
        assert_eq!(parse_intervention_input(" HALT ", skip).unwrap(), InterventionAction::Halt);
        assert_eq!(parse_intervention_input("\n", skip).unwrap(), skip);
        assert!(parse_intervention_input("maybe", skip).is_err());
    }

    #[test]
    fn test_risk_level_styles() {
        assert_eq!(risk_level_style(RiskLevel::Critical), ("1;31", "CRITICAL"));
        assert_eq!(risk_level_style(RiskLevel::High), ("33", "HIGH"));
    }
}
