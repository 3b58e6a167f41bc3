//! Bug report links attached to engine panics.

use crate::constants::ISSUE_TRACKER_URL;
use reqwest::Url;

/// Context included in a pre-filled bug report
#[derive(Debug, Clone, Default)]
pub struct ReportContext<'a> {
    pub client_version: &'a str,
    pub engine_version: Option<&'a str>,
    pub platform: &'a str,
    pub engine_type: &'a str,
    pub error_message: &'a str,
}

/// Build an issue-tracker URL pre-filled with the panic details
pub fn bug_report_url(title: &str, body: &str) -> String {
    match Url::parse_with_params(
        ISSUE_TRACKER_URL,
        &[("body", body), ("title", title), ("template", "bug_report.md")],
    ) {
        Ok(url) => url.to_string(),
        Err(_) => ISSUE_TRACKER_URL.to_string(),
    }
}

fn report_body(context: &ReportContext<'_>) -> String {
    format!(
        "Hi Prisma Team! The query engine just crashed.\n\n\
         ## Versions\n\n\
         | Name | Version |\n\
         |------|---------|\n\
         | Client | {} |\n\
         | Engine | {} |\n\
         | Platform | {} |\n\
         | Engine type | {} |\n\n\
         ## Logs\n\n```\n{}\n```\n",
        context.client_version,
        context.engine_version.unwrap_or("unknown"),
        context.platform,
        context.engine_type,
        context.error_message,
    )
}

/// Full panic message: the engine's own text followed by the report link
pub fn panic_message(context: &ReportContext<'_>) -> String {
    let title = format!(
        "Query engine panic: {}",
        context.error_message.lines().next().unwrap_or("unknown panic")
    );
    let url = bug_report_url(&title, &report_body(context));

    format!(
        "{}\n\nThis is a non-recoverable error which probably happens when the query engine panics.\n\n{}\n\n\
         If you want the maintainers to look into it, please open the link above.\n\
         Attaching your schema and the code that triggered the panic helps reproduce it.\n",
        context.error_message, url
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bug_report_url_is_encoded() {
        let url = bug_report_url("a title", "line one\nline two & more");
        assert!(url.starts_with(ISSUE_TRACKER_URL));
        assert!(url.contains("template=bug_report.md"));
        assert!(url.contains("title=a+title"));
        assert!(!url.contains('\n'));
        assert!(url.contains("%26"));
    }

    #[test]
    fn test_panic_message_contains_original_text_and_link() {
        let context = ReportContext {
            client_version: "5.0.0",
            engine_version: Some("abc123"),
            platform: "debian-openssl-3.0.x",
            engine_type: "binary",
            error_message: "index out of bounds: the len is 0",
        };
        let message = panic_message(&context);
        assert!(message.starts_with("index out of bounds: the len is 0"));
        assert!(message.contains(ISSUE_TRACKER_URL));
    }
}
