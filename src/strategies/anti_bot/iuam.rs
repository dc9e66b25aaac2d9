//! "I'm Under Attack" challenge form handling.
//!
//! The page carries a form with a handful of hidden fields plus a script that
//! computes `jschl_answer`. The interpreter produces the answer; this module
//! extracts everything else and builds the submission.

use std::time::Duration;

use http::{HeaderValue, Method, header::ORIGIN};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use thiserror::Error;
use url::Url;

use crate::core::{FetchRequest, profile};

/// Delay used when the page does not announce one.
const DEFAULT_DELAY: Duration = Duration::from_secs(4);

const REQUIRED_FIELDS: [&str; 3] = ["r", "jschl_vc", "pass"];

static IUAM_FORM_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(
        r#"<form[^>]*id=['"]challenge-form['"][^>]*action=['"](?P<action>[^"']*__cf_chl_(?:f_tk|jschl_tk__)=[^"']+)['"][^>]*>(?P<inputs>.*?)</form>"#,
    )
    .case_insensitive(true)
    .dot_matches_new_line(true)
    .build()
    .unwrap()
});

static INPUT_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"<input\s+([^>]+?)/?>"#)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .unwrap()
});

static ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"(?P<name>[^\s=]+)=['"](?P<value>[^'"]*)['"]"#)
        .case_insensitive(true)
        .build()
        .unwrap()
});

static DELAY_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"submit\(\);\r?\n\s*},\s*([0-9]+)"#)
        .case_insensitive(true)
        .build()
        .unwrap()
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IuamError {
    #[error("unable to locate challenge form")]
    FormNotFound,
    #[error("missing required hidden field: {0}")]
    MissingField(&'static str),
    #[error("invalid challenge action: {0}")]
    InvalidAction(url::ParseError),
}

/// Parsed challenge form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IuamChallenge {
    pub action: Url,
    pub hidden_fields: Vec<(String, String)>,
    /// How long the page waits before auto-submitting.
    pub delay: Duration,
}

impl IuamChallenge {
    pub fn parse(body: &str, page_url: &Url) -> Result<Self, IuamError> {
        let captures = IUAM_FORM_RE.captures(body).ok_or(IuamError::FormNotFound)?;

        let action = captures
            .name("action")
            .map(|m| html_escape::decode_html_entities(m.as_str()).to_string())
            .ok_or(IuamError::FormNotFound)?;
        let action = page_url.join(&action).map_err(IuamError::InvalidAction)?;

        let inputs = captures.name("inputs").map(|m| m.as_str()).unwrap_or("");
        let hidden_fields = extract_hidden_fields(inputs)?;

        Ok(Self {
            action,
            hidden_fields,
            delay: extract_delay(body).unwrap_or(DEFAULT_DELAY),
        })
    }

    /// POST carrying the hidden fields and the computed answer, sent from the
    /// challenge page like a browser would.
    pub fn submission(self, answer: String, page_url: &Url, user_agent: &str) -> FetchRequest {
        let mut fields = vec![("jschl_answer".to_string(), answer)];
        fields.extend(self.hidden_fields);

        let mut headers = profile::browser_headers_with_referer(user_agent, page_url.as_str());
        if let Ok(origin) = HeaderValue::from_str(&origin_from_url(page_url)) {
            headers.insert(ORIGIN, origin);
        }
        FetchRequest::submit_form(Method::POST, self.action, fields).with_headers(headers)
    }
}

/// `scheme://host[:port]` of a URL.
pub fn origin_from_url(url: &Url) -> String {
    let mut origin = format!("{}://{}", url.scheme(), url.host_str().unwrap_or(""));
    if let Some(port) = url.port() {
        origin.push(':');
        origin.push_str(&port.to_string());
    }
    origin
}

fn extract_hidden_fields(fragment: &str) -> Result<Vec<(String, String)>, IuamError> {
    let mut payload = Vec::new();

    for caps in INPUT_RE.captures_iter(fragment) {
        let attributes = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let mut field_name = None;
        let mut field_value = None;

        for attr in ATTR_RE.captures_iter(attributes) {
            if let (Some(name), Some(value)) = (attr.name("name"), attr.name("value")) {
                match name.as_str().to_ascii_lowercase().as_str() {
                    "name" => field_name = Some(value.as_str().to_string()),
                    "value" => field_value = Some(value.as_str().to_string()),
                    _ => {}
                }
            }
        }

        if let (Some(name), Some(value)) = (field_name, field_value)
            && REQUIRED_FIELDS.contains(&name.as_str())
        {
            payload.push((name, value));
        }
    }

    for key in REQUIRED_FIELDS {
        if !payload.iter().any(|(name, _)| name == key) {
            return Err(IuamError::MissingField(key));
        }
    }
    Ok(payload)
}

fn extract_delay(body: &str) -> Option<Duration> {
    DELAY_RE
        .captures(body)?
        .get(1)?
        .as_str()
        .parse::<u64>()
        .ok()
        .map(Duration::from_millis)
}

#[cfg(test)]
pub(super) mod fixtures {
    /// Minimal IUAM page; the script sets the answer to 15.
    pub const CHALLENGE_PAGE: &str = r#"<html><head><title>Just a moment...</title></head><body>
<form id="challenge-form" action="/abc?__cf_chl_f_tk=tok123" method="POST">
    <input type="hidden" name="r" value="rv"/>
    <input type="hidden" name="jschl_vc" value="vc"/>
    <input type="hidden" name="pass" value="pw"/>
    <input type="hidden" id="jschl_answer" name="jschl_answer"/>
</form>
<script>
  setTimeout(function(){
    var a = document.getElementById('jschl_answer');
    a.value = 10 + 5;
    document.getElementById('challenge-form').submit();
  }, 25);
</script>
</body></html>"#;
}
