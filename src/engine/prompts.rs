use std::fmt::Write;

use flagforge_common::{FuzzTaskStatus, Stage};

use crate::run::RunState;

const MAX_PAGES: usize = 30;
const MAX_FORMS: usize = 15;
const MAX_FINDINGS: usize = 15;
const MAX_SOURCE_CHARS: usize = 4000;

const ROLE: &str = "You are an offensive security assistant solving an authorized web CTF challenge. \
Work only against the challenge target and the local challenge files.";

/// Stage instructions sent as the oracle's system prompt.
pub fn instructions(stage: Stage) -> String {
    let task = match stage {
        Stage::Crawl => "Map the application: pages, forms and interesting endpoints.",
        Stage::Summarize => {
            "Analyze the crawled pages and any provided source code. Identify the technology stack, \
             the data flow, hidden functionality, debug features and hardcoded secrets. \
             Fetch pages or read challenge files when the collected data is not enough. \
             Finish with a summary of everything security-relevant."
        }
        Stage::ThreatModel => {
            "Perform STRIDE threat modeling of the application. Focus on vulnerabilities common in \
             CTF challenges: SQL injection, XSS, command injection, authentication and authorization \
             bypass, path traversal, file upload, SSRF, XXE and insecure deserialization. \
             Finish by listing the vulnerabilities with a severity and the fuzz tasks that would \
             exploit them, each with a concrete target URL and payload class."
        }
        Stage::Fuzz => {
            "Exploit the current fuzz task. Send crafted requests with the available tools, \
             adapt the payloads to each response and look for the flag in every output. \
             Declare the stage complete when the task is exhausted or the flag is found."
        }
        Stage::Done => "The run is finished.",
    };
    format!("{}\n\n{}", ROLE, task)
}

/// Compact text rendering of the run so far.
pub fn state_summary(state: &RunState) -> String {
    let input = state.input();
    let mut out = String::new();

    let _ = writeln!(out, "Challenge: {}", input.display_name());
    let _ = writeln!(out, "Target: {}", input.target_url);
    if let Some(description) = &input.description {
        let _ = writeln!(out, "Description: {}", description);
    }
    if let Some(format) = &input.flag_format {
        let _ = writeln!(out, "Flag format: {}", format);
    }
    if let Some(hint) = &input.hint {
        let _ = writeln!(out, "Hint: {}", hint);
    }
    if let Some(source) = &input.source {
        let shown: String = source.chars().take(MAX_SOURCE_CHARS).collect();
        let _ = writeln!(out, "\nSource code:\n{}", shown);
        if shown.len() < source.len() {
            let _ = writeln!(out, "... (source truncated)");
        }
    }

    section(&mut out, "Pages", state.pages().len(), MAX_PAGES, state.pages().iter().map(String::clone));

    section(
        &mut out,
        "Forms",
        state.forms().len(),
        MAX_FORMS,
        state.forms().iter().map(|f| {
            let fields: Vec<String> = f
                .fields
                .iter()
                .map(|field| format!("{}:{}", field.name, field.field_type))
                .collect();
            format!("{} {} [{}] (on {})", f.method, f.action, fields.join(", "), f.page_url)
        }),
    );

    // most recent findings matter most
    let findings = state.findings();
    let skip = findings.len().saturating_sub(MAX_FINDINGS);
    section(
        &mut out,
        "Findings",
        findings.len(),
        MAX_FINDINGS,
        findings[skip..].iter().map(|f| format!("[{}] {}", f.stage, f.text)),
    );

    section(
        &mut out,
        "Vulnerabilities",
        state.vulnerabilities().len(),
        usize::MAX,
        state.vulnerabilities().iter().map(|v| match &v.location {
            Some(loc) => format!("{} ({}) at {}: {}", v.vuln_type, v.severity, loc, v.description),
            None => format!("{} ({}): {}", v.vuln_type, v.severity, v.description),
        }),
    );

    section(
        &mut out,
        "Fuzz queue",
        state.fuzz_queue().len(),
        usize::MAX,
        state.fuzz_queue().iter().map(|t| {
            let status = match t.status {
                FuzzTaskStatus::Pending => "pending",
                FuzzTaskStatus::Attempted => "attempted",
            };
            format!("{} {} [{}]", t.payload_class, t.target, status)
        }),
    );

    if !state.flags().is_empty() {
        let values: Vec<&str> = state.flags().iter().map(|f| f.value.as_str()).collect();
        let _ = writeln!(out, "\nFlags captured: {}", values.join(", "));
    }

    out
}

fn section(out: &mut String, title: &str, total: usize, limit: usize, items: impl Iterator<Item = String>) {
    if total == 0 {
        let _ = writeln!(out, "\n{}: none", title);
        return;
    }
    let _ = writeln!(out, "\n{} ({}):", title, total);
    for item in items.take(limit) {
        let _ = writeln!(out, "- {}", item);
    }
    if total > limit {
        let _ = writeln!(out, "- ... {} more", total - limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flagforge_common::{FormDescriptor, FormField, FuzzTask, RunInput, Severity, Vulnerability};
    use uuid::Uuid;

    fn state() -> RunState {
        let mut input = RunInput::new("http://ctf.local/");
        input.title = Some("Baby SQL".into());
        input.flag_format = Some("CTF{*}".into());
        input.source = Some("x".repeat(MAX_SOURCE_CHARS + 10));
        let mut s = RunState::new(Uuid::new_v4(), input);
        s.start().unwrap();
        s
    }

    #[test]
    fn test_instructions_differ_per_stage() {
        assert!(instructions(Stage::Summarize).contains("source code"));
        assert!(instructions(Stage::ThreatModel).contains("STRIDE"));
        assert!(instructions(Stage::Fuzz).contains("fuzz task"));
    }

    #[test]
    fn test_summary_of_empty_run() {
        let s = state();
        let text = state_summary(&s);
        assert!(text.contains("Challenge: Baby SQL"));
        assert!(text.contains("Flag format: CTF{*}"));
        assert!(text.contains("(source truncated)"));
        assert!(text.contains("Pages: none"));
        assert!(text.contains("Fuzz queue: none"));
        assert!(!text.contains("Flags captured"));
    }

    #[test]
    fn test_summary_lists_collected_data() {
        let mut s = state();
        s.add_page("http://ctf.local/login").unwrap();
        s.add_form(FormDescriptor {
            action: "http://ctf.local/login".into(),
            method: "POST".into(),
            fields: vec![FormField {
                name: "user".into(),
                field_type: "text".into(),
                required: true,
            }],
            page_url: "http://ctf.local/".into(),
        })
        .unwrap();
        s.add_vulnerability(Vulnerability {
            vuln_type: "sqli".into(),
            description: "login query concatenates input".into(),
            severity: Severity::High,
            location: Some("/login".into()),
        })
        .unwrap();
        s.enqueue_fuzz(FuzzTask::pending("http://ctf.local/login", "sqli")).unwrap();
        s.record_flag("CTF{x}", Stage::Fuzz).unwrap();

        let text = state_summary(&s);
        assert!(text.contains("- http://ctf.local/login"));
        assert!(text.contains("POST http://ctf.local/login [user:text]"));
        assert!(text.contains("sqli (high) at /login"));
        assert!(text.contains("sqli http://ctf.local/login [pending]"));
        assert!(text.contains("Flags captured: CTF{x}"));
    }

    #[test]
    fn test_summary_caps_long_sections() {
        let mut s = state();
        for i in 0..(MAX_PAGES + 5) {
            s.add_page(&format!("http://ctf.local/p{i}")).unwrap();
        }
        let text = state_summary(&s);
        assert!(text.contains(&format!("Pages ({}):", MAX_PAGES + 5)));
        assert!(text.contains("... 5 more"));
    }
}
