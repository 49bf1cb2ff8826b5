//! Response templating.
//!
//! Uses Handlebars with the request as context. Request fields are available
//! both at the top level (`{{method}}`, `{{query.page}}`) and under
//! `request` (`{{request.headers.[x-id]}}`).

mod helpers;

use crate::request::RequestView;
use handlebars::Handlebars;
use serde_json::Value;
use tracing::warn;

pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();
        helpers::register(&mut handlebars);
        // Bodies are JSON, XML or plain text; never HTML-escape them.
        handlebars.register_escape_fn(handlebars::no_escape);
        Self { handlebars }
    }

    pub fn context(request: &RequestView) -> Value {
        let mut context = request.to_context();
        let nested = context.clone();
        if let Value::Object(map) = &mut context {
            map.insert("request".to_string(), nested);
        }
        context
    }

    pub fn try_render(
        &self,
        template: &str,
        context: &Value,
    ) -> Result<String, handlebars::RenderError> {
        self.handlebars.render_template(template, context)
    }

    /// Render, falling back to the literal text when rendering fails.
    pub fn render(&self, template: &str, context: &Value) -> String {
        if !template.contains("{{") {
            return template.to_string();
        }
        match self.try_render(template, context) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!("Template rendering failed, using literal text: {}", e);
                template.to_string()
            }
        }
    }

    pub fn render_request(&self, template: &str, request: &RequestView) -> String {
        self.render(template, &Self::context(request))
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn request() -> RequestView {
        RequestView::new("POST", "/users/42?page=3")
            .with_header("X-Request-Id", "req-1")
            .with_body(r#"{"name": "Ada"}"#)
            .with_remote_addr("10.0.0.1:5555".parse().unwrap())
    }

    #[test]
    fn test_request_accessors() {
        let engine = TemplateEngine::new();
        let out = engine.render_request(
            "{{method}} {{path}} {{query.page}} {{request.headers.[x-request-id]}} {{json.name}} {{remoteAddr}}",
            &request(),
        );
        assert_eq!(out, "POST /users/42 3 req-1 Ada 10.0.0.1:5555");
    }

    #[test]
    fn test_body_is_not_escaped() {
        let engine = TemplateEngine::new();
        let req = RequestView::new("GET", "/").with_body("<a & b>");
        let out = engine.render_request(r#"{"echo": "{{body}}"}"#, &req);
        assert_eq!(out, r#"{"echo": "<a & b>"}"#);
    }

    #[test]
    fn test_render_error_falls_back_to_literal() {
        let engine = TemplateEngine::new();
        let literal = "{{#if}}broken";
        assert_eq!(engine.render_request(literal, &request()), literal);
    }

    #[test]
    fn test_plain_text_is_untouched() {
        let engine = TemplateEngine::new();
        assert_eq!(engine.render_request("no templates here", &request()), "no templates here");
    }

    #[test]
    fn test_fake_data_helpers() {
        let engine = TemplateEngine::new();
        let req = request();

        let uuid = engine.render_request("{{uuid}}", &req);
        assert!(uuid::Uuid::parse_str(&uuid).is_ok());

        let s = engine.render_request("{{randomString 12}}", &req);
        assert_eq!(s.len(), 12);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));

        let n: i64 = engine.render_request("{{randomInt 5 10}}", &req).parse().unwrap();
        assert!((5..=10).contains(&n));

        let f: f64 = engine.render_request("{{randomFloat 1 2}}", &req).parse().unwrap();
        assert!((1.0..=2.0).contains(&f));

        let b = engine.render_request("{{randomBool}}", &req);
        assert!(b == "true" || b == "false");

        for helper in [
            "firstName", "lastName", "fullName", "city", "country", "streetAddress", "zipCode",
            "companyName", "industry", "username", "ipv4",
        ] {
            let out = engine.render_request(&format!("{{{{{helper}}}}}"), &req);
            assert!(!out.is_empty(), "{helper} rendered nothing");
            assert!(!out.contains("{{"), "{helper} was not rendered");
        }

        let email = engine.render_request("{{email}}", &req);
        assert!(email.contains('@'));
    }

    #[test]
    fn test_now_formats() {
        let engine = TemplateEngine::new();
        let req = request();
        let unix: i64 = engine.render_request("{{now \"unix\"}}", &req).parse().unwrap();
        assert!(unix > 1_600_000_000);
        let date = engine.render_request("{{now \"date\"}}", &req);
        assert!(Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap().is_match(&date));
        let custom = engine.render_request("{{now \"%Y\"}}", &req);
        assert_eq!(custom.len(), 4);
    }

    #[test]
    fn test_invalid_date_format_falls_back_to_literal() {
        let engine = TemplateEngine::new();
        let literal = r#"at {{now "%Q"}}"#;
        assert_eq!(engine.render_request(literal, &request()), literal);
        assert!(engine
            .try_render(literal, &TemplateEngine::context(&request()))
            .is_err());
    }

    #[test]
    fn test_case_helpers() {
        let engine = TemplateEngine::new();
        let req = RequestView::new("GET", "/?name=order%20status");
        assert_eq!(engine.render_request("{{upper query.name}}", &req), "ORDER STATUS");
        assert_eq!(engine.render_request("{{title query.name}}", &req), "Order Status");
        assert_eq!(engine.render_request("{{snake query.name}}", &req), "order_status");
        assert_eq!(engine.render_request("{{camel query.name}}", &req), "orderStatus");
        assert_eq!(engine.render_request("{{lower \"ABC\"}}", &req), "abc");
    }
}
