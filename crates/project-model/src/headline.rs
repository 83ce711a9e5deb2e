//! Caption suggestion contract.
//!
//! Suggestions come from an external text-generation service. This module
//! owns the prompt sent to it and the parsing of what comes back; the
//! transport is behind [`HeadlineService`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use viralize_common::{ViralizeError, ViralizeResult};

/// Tones requested from the service, one headline each.
pub const HEADLINE_TONES: [&str; 3] = ["Polêmico", "Educativo", "Hype"];

/// One suggested caption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headline {
    pub tone: String,
    pub text: String,
}

/// What the service is asked about.
#[derive(Debug, Clone)]
pub struct HeadlineRequest {
    pub video: PathBuf,
    pub mime_type: String,
    /// Optional free-text hint from the user.
    pub context: Option<String>,
}

impl HeadlineRequest {
    pub fn prompt(&self) -> String {
        build_prompt(self.context.as_deref())
    }
}

/// A text-generation backend able to suggest captions for a video.
pub trait HeadlineService {
    fn suggest(&self, request: &HeadlineRequest) -> ViralizeResult<Vec<Headline>>;
}

/// Build the fixed prompt, with the user's context spliced in when present.
pub fn build_prompt(context: Option<&str>) -> String {
    let context = context
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(|c| format!("Considere este contexto adicional: {c}. "))
        .unwrap_or_default();
    let tones = HEADLINE_TONES
        .iter()
        .map(|t| format!("'{t}'"))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "Analise este vídeo para Instagram Reels/TikTok. {context}\
         Gere 3 headlines virais em JSON com os campos 'tone' e 'text'. \
         Os tons devem ser: {tones}. \
         O texto das headlines deve ser em PORTUGUÊS DO BRASIL (PT-BR), informal e engajador. \
         Retorne APENAS o JSON."
    )
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HeadlinePayload {
    Bare(Vec<Headline>),
    Wrapped { headlines: Vec<Headline> },
}

/// Parse a service response into headlines.
///
/// Accepts a bare JSON array or an object with a `headlines` array, with or
/// without surrounding markdown code fences.
pub fn parse_headline_response(raw: &str) -> ViralizeResult<Vec<Headline>> {
    let cleaned = raw.replace("```json", "").replace("```", "");
    let payload: HeadlinePayload = serde_json::from_str(cleaned.trim())
        .map_err(|e| ViralizeError::service(format!("invalid headline response: {e}")))?;

    let headlines = match payload {
        HeadlinePayload::Bare(list) => list,
        HeadlinePayload::Wrapped { headlines } => headlines,
    };

    if headlines.is_empty() {
        return Err(ViralizeError::service("headline response contained no headlines"));
    }
    if headlines.len() != HEADLINE_TONES.len() {
        tracing::warn!(count = headlines.len(), "Unexpected number of headlines");
    }
    Ok(headlines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_includes_context_and_tones() {
        let prompt = build_prompt(Some("  receita de bolo "));
        assert!(prompt.contains("Considere este contexto adicional: receita de bolo."));
        assert!(prompt.contains("'Polêmico', 'Educativo', 'Hype'"));

        let bare = build_prompt(Some("   "));
        assert!(!bare.contains("contexto adicional"));
    }

    #[test]
    fn test_parse_bare_array_in_fences() {
        let raw = "```json\n[{\"tone\":\"Hype\",\"text\":\"Olha isso\"},{\"tone\":\"Educativo\",\"text\":\"Aprenda\"},{\"tone\":\"Polêmico\",\"text\":\"Ninguém fala\"}]\n```";
        let parsed = parse_headline_response(raw).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].tone, "Hype");
    }

    #[test]
    fn test_parse_wrapped_object() {
        let raw = r#"{"headlines": [{"tone": "Hype", "text": "Uau"}]}"#;
        let parsed = parse_headline_response(raw).unwrap();
        assert_eq!(parsed, vec![Headline { tone: "Hype".into(), text: "Uau".into() }]);
    }

    #[test]
    fn test_malformed_response_is_service_error() {
        for raw in ["Desculpe, não consigo.", r#"{"items": []}"#, "[]"] {
            let err = parse_headline_response(raw).unwrap_err();
            assert!(matches!(err, ViralizeError::Service { .. }), "{raw}");
        }
    }

    struct CannedService(&'static str);

    impl HeadlineService for CannedService {
        fn suggest(&self, _request: &HeadlineRequest) -> ViralizeResult<Vec<Headline>> {
            parse_headline_response(self.0)
        }
    }

    #[test]
    fn test_service_contract() {
        let request = HeadlineRequest {
            video: PathBuf::from("clip.mp4"),
            mime_type: "video/mp4".into(),
            context: None,
        };
        let service = CannedService(r#"[{"tone":"Hype","text":"A"}]"#);
        assert_eq!(service.suggest(&request).unwrap().len(), 1);
        assert!(request.prompt().starts_with("Analise este vídeo"));
    }
}
