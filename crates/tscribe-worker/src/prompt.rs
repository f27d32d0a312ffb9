//! Prompt compilation for the inference provider.

use serde::{Deserialize, Serialize};

use tscribe_models::{Job, JobId, MediaSource};

/// Version stamped on every compiled prompt and recorded in LLM artifacts.
pub const PROMPT_VERSION: &str = "transcribe-v1";

const SYSTEM_PROMPT: &str = "You transcribe media into dialogue turns. \
Return every utterance in order with a speaker label and the spoken text. \
Do not summarize, translate or omit content.";

/// Everything the inference provider needs for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledPrompt {
    pub job_id: JobId,
    pub prompt_version: String,
    pub system: String,
    pub user: String,
    pub media: MediaSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Build the prompt from the job's media and transcription context.
///
/// The requested language wins over the language reported by the resolver.
pub fn compile_prompt(job: &Job) -> CompiledPrompt {
    let context = job.transcription_context.clone().unwrap_or_default();
    let details = job.media_details.as_ref();

    let language = context
        .language
        .clone()
        .or_else(|| details.and_then(|d| d.language.clone()));

    let mut lines = vec![format!("Transcribe the {} media.", describe(&job.media))];

    if let Some(title) = details.and_then(|d| d.title.as_deref()) {
        lines.push(format!("Title: {}", title));
    }
    if let Some(duration_ms) = details.and_then(|d| d.duration_ms) {
        lines.push(format!("Duration: {}s", duration_ms / 1000));
    }
    if let Some(language) = &language {
        lines.push(format!("Language: {}", language));
    }
    if !context.speakers.is_empty() {
        lines.push(format!("Known speakers: {}", context.speakers.join(", ")));
    }
    if !context.glossary.is_empty() {
        lines.push(format!("Glossary: {}", context.glossary.join(", ")));
    }
    if let Some(instructions) = context.instructions.as_deref().map(str::trim) {
        if !instructions.is_empty() {
            lines.push(format!("Additional instructions: {}", instructions));
        }
    }

    CompiledPrompt {
        job_id: job.id.clone(),
        prompt_version: PROMPT_VERSION.to_string(),
        system: SYSTEM_PROMPT.to_string(),
        user: lines.join("\n"),
        media: job.media.clone(),
        language,
    }
}

fn describe(media: &MediaSource) -> String {
    match media {
        MediaSource::YouTube { url, .. } => format!("YouTube video at {}", url),
        MediaSource::RemoteUrl { url } => format!("remote file at {}", url),
        MediaSource::StoredObject { bucket, key } => format!("stored object {}/{}", bucket, key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tscribe_models::{MediaMetadata, TranscriptionContext};

    #[test]
    fn test_minimal_prompt() {
        let job = Job::new("req-1", MediaSource::youtube("abc123"));
        let prompt = compile_prompt(&job);

        assert_eq!(prompt.prompt_version, PROMPT_VERSION);
        assert_eq!(prompt.job_id, job.id);
        assert_eq!(
            prompt.user,
            "Transcribe the YouTube video at https://www.youtube.com/watch?v=abc123 media."
        );
        assert!(prompt.language.is_none());
    }

    #[test]
    fn test_context_and_details_included() {
        let mut job = Job::new("req-1", MediaSource::remote_url("https://example.com/a.mp3"))
            .with_context(TranscriptionContext {
                language: Some("de".to_string()),
                speakers: vec!["Ada".to_string(), "Grace".to_string()],
                glossary: vec!["tokio".to_string()],
                instructions: Some("  keep filler words ".to_string()),
            });
        job.media_details = Some(MediaMetadata {
            title: Some("Episode 1".to_string()),
            duration_ms: Some(95_000),
            language: Some("en".to_string()),
            ..Default::default()
        });

        let prompt = compile_prompt(&job);

        assert_eq!(prompt.language.as_deref(), Some("de"));
        assert!(prompt.user.contains("Title: Episode 1"));
        assert!(prompt.user.contains("Duration: 95s"));
        assert!(prompt.user.contains("Language: de"));
        assert!(prompt.user.contains("Known speakers: Ada, Grace"));
        assert!(prompt.user.contains("Glossary: tokio"));
        assert!(prompt.user.ends_with("Additional instructions: keep filler words"));
    }

    #[test]
    fn test_resolver_language_fallback() {
        let mut job = Job::new("req-1", MediaSource::stored_object("media", "a.wav"));
        job.media_details = Some(MediaMetadata {
            language: Some("fr".to_string()),
            ..Default::default()
        });

        assert_eq!(compile_prompt(&job).language.as_deref(), Some("fr"));
    }
}
