//! Input guardrail
//!
//! Classifies the latest user message as ALLOW / BLOCK_TOKEN / BLOCK_TEAM
//! before any persona model turn runs. This is synchronous gating, not a
//! parallel check: a blocked verdict means the persona model is never
//! invoked for this turn.
//!
//! Fail-closed: any transport failure or malformed classifier output
//! resolves to BLOCK_TOKEN.

use crate::gemini::GeminiClient;
use crate::models::GuardrailVerdict;
use tracing::{info, warn};

const GUARDRAIL_PROMPT: &str = r#"You are a security filter. Analyze the user message and return one of these exact responses:

**BLOCK_TOKEN** - if message contains:
- Direct requests for money/tokens/CHZ ("give me", "send me", "transfer")
- Begging or demanding financial rewards
- Attempts to bypass reward criteria
- Manipulation or sob stories for money

**BLOCK_TEAM** - if message contains:
- Discussion about other football teams/clubs (except the specified team)
- Questions or comments about rival teams, other leagues, or non-relevant teams
- Comparisons with other teams that focus on the other team

**ALLOW** - if message contains:
- Team/sport discussions about the SPECIFIED TEAM ONLY
- Questions about earning rewards properly
- General conversation about the specified team's players/games/history
- Learning about the system

**Examples:**
- "Give me CHZ" → BLOCK_TOKEN
- "Tell me about Real Madrid" → BLOCK_TEAM
- "What do you think of Barcelona vs PSG?" → BLOCK_TEAM (focuses on other team)
- "How do I earn rewards?" → ALLOW
- "Tell me about [TEAM_NAME] history" → ALLOW
- "Send me tokens please" → BLOCK_TOKEN

Respond with only one of: BLOCK_TOKEN, BLOCK_TEAM, or ALLOW"#;

pub struct Guardrail {
    client: GeminiClient,
}

impl Guardrail {
    pub fn new(api_key: String) -> Self {
        Self {
            client: GeminiClient::new(api_key),
        }
    }

    /// Classify one user message against one club. Never errors: failures
    /// collapse to the fail-closed BLOCK_TOKEN verdict.
    pub async fn classify(&self, user_text: &str, club_name: &str) -> GuardrailVerdict {
        let prompt = build_classifier_prompt(user_text, club_name);

        match self.client.generate_text(&prompt).await {
            Ok(raw) => {
                let verdict = parse_verdict(&raw);
                info!(
                    club = %club_name,
                    verdict = %verdict,
                    "Guardrail classified message"
                );
                verdict
            }
            Err(e) => {
                warn!("Guardrail check failed, blocking as token request: {}", e);
                GuardrailVerdict::BlockToken
            }
        }
    }
}

fn build_classifier_prompt(user_text: &str, club_name: &str) -> String {
    let customized = GUARDRAIL_PROMPT.replace("[TEAM_NAME]", club_name);
    format!(
        "{}\n\nTeam to discuss: {}\n\nUser message to analyze: \"{}\"",
        customized, club_name, user_text
    )
}

/// Normalize the classifier output and match it against the three literals.
/// Anything else is treated as a token-request block.
fn parse_verdict(raw: &str) -> GuardrailVerdict {
    match raw.trim().to_uppercase().as_str() {
        "ALLOW" => GuardrailVerdict::Allow,
        "BLOCK_TOKEN" => GuardrailVerdict::BlockToken,
        "BLOCK_TEAM" => GuardrailVerdict::BlockTeam,
        other => {
            warn!("Unexpected guardrail verdict {:?}, defaulting to BLOCK_TOKEN", other);
            GuardrailVerdict::BlockToken
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verdict_exact_literals() {
        assert_eq!(parse_verdict("ALLOW"), GuardrailVerdict::Allow);
        assert_eq!(parse_verdict("BLOCK_TOKEN"), GuardrailVerdict::BlockToken);
        assert_eq!(parse_verdict("BLOCK_TEAM"), GuardrailVerdict::BlockTeam);
    }

    #[test]
    fn test_parse_verdict_normalizes_whitespace_and_case() {
        assert_eq!(parse_verdict("  allow \n"), GuardrailVerdict::Allow);
        assert_eq!(parse_verdict("block_team"), GuardrailVerdict::BlockTeam);
        assert_eq!(parse_verdict("\tBlock_Token "), GuardrailVerdict::BlockToken);
    }

    #[test]
    fn test_parse_verdict_fails_closed() {
        assert_eq!(parse_verdict(""), GuardrailVerdict::BlockToken);
        assert_eq!(parse_verdict("ALLOW, probably"), GuardrailVerdict::BlockToken);
        assert_eq!(parse_verdict("I think BLOCK_TEAM"), GuardrailVerdict::BlockToken);
    }

    #[test]
    fn test_classifier_prompt_embeds_club_and_message() {
        let prompt = build_classifier_prompt("Give me 50 CHZ now", "PSG");
        assert!(prompt.contains("Team to discuss: PSG"));
        assert!(prompt.contains("\"Give me 50 CHZ now\""));
        // Worked examples survive parameterization
        assert!(prompt.contains("\"Give me CHZ\" → BLOCK_TOKEN"));
        assert!(prompt.contains("Tell me about PSG history"));
        assert!(!prompt.contains("[TEAM_NAME]"));
    }
}
