use anyhow::{Result, anyhow};

use crate::dom::{OBSERVATION_MARKER, observe};
use crate::hands::BrowserPage;
use crate::types::{Message, ToolCall, ToolName};

/// Execute one tool call against the page and return the `tool` message for it.
///
/// Page-level failures never escape: they come back as a message starting
/// with `"Error:"` followed by whatever the page currently shows, so the
/// model can react on its next turn.
pub fn dispatch(page: &dyn BrowserPage, call: &ToolCall) -> Message {
    let outcome = perform(page, call).and_then(|()| observe(page));

    match outcome {
        Ok(observation) => Message::tool(&call.id, observation),
        Err(err) => {
            tracing::warn!(
                tool = call.name.as_str(),
                selector = %call.arguments.selector,
                "tool call failed: {err:#}"
            );
            let observation = observe(page).unwrap_or_else(|observe_err| {
                tracing::debug!("could not re-observe page after failure: {observe_err:#}");
                format!("{OBSERVATION_MARKER}\n")
            });
            Message::tool(&call.id, format!("Error: {err:#}\n{observation}"))
        }
    }
}

fn perform(page: &dyn BrowserPage, call: &ToolCall) -> Result<()> {
    let args = &call.arguments;
    match call.name {
        ToolName::Click => page.click(&args.selector)?,
        ToolName::Type => page.type_text(&args.selector, required_value(call)?)?,
        ToolName::Select => page.select_option(&args.selector, required_value(call)?)?,
    }
    page.wait_for_settle()
}

fn required_value(call: &ToolCall) -> Result<&str> {
    call.arguments
        .value
        .as_deref()
        .ok_or_else(|| anyhow!("'{}' requires a value", call.name.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolArguments;
    use anyhow::bail;
    use std::sync::Mutex;

    /// Page with a fixed set of selectors; every action is recorded.
    struct StaticPage {
        selectors: Vec<&'static str>,
        body: Mutex<String>,
        actions: Mutex<Vec<String>>,
    }

    impl StaticPage {
        fn new(selectors: Vec<&'static str>, body: &str) -> Self {
            Self {
                selectors,
                body: Mutex::new(body.to_string()),
                actions: Mutex::new(Vec::new()),
            }
        }

        fn find(&self, selector: &str) -> Result<()> {
            if self.selectors.contains(&selector) {
                Ok(())
            } else {
                bail!("No element found for selector {selector}")
            }
        }

        fn record(&self, action: String) {
            self.actions.lock().unwrap().push(action);
        }
    }

    impl BrowserPage for StaticPage {
        fn goto(&self, _url: &str) -> Result<()> {
            Ok(())
        }
        fn click(&self, selector: &str) -> Result<()> {
            self.find(selector)?;
            self.record(format!("click {selector}"));
            *self.body.lock().unwrap() = "<h1>Pricing</h1>".to_string();
            Ok(())
        }
        fn type_text(&self, selector: &str, value: &str) -> Result<()> {
            self.find(selector)?;
            self.record(format!("type {selector} {value}"));
            Ok(())
        }
        fn select_option(&self, selector: &str, value: &str) -> Result<()> {
            self.find(selector)?;
            self.record(format!("select {selector} {value}"));
            Ok(())
        }
        fn wait_for_settle(&self) -> Result<()> {
            self.record("settle".to_string());
            Ok(())
        }
        fn body_html(&self) -> Result<String> {
            Ok(self.body.lock().unwrap().clone())
        }
        fn screenshot_jpeg(&self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn call(name: ToolName, selector: &str, value: Option<&str>) -> ToolCall {
        ToolCall {
            id: "call_1".into(),
            name,
            arguments: ToolArguments {
                selector: selector.into(),
                value: value.map(String::from),
                reasoning: "audit only".into(),
            },
        }
    }

    #[test]
    fn click_then_reobserves() {
        let page = StaticPage::new(vec!["#pricing"], "<a id=\"pricing\">Pricing</a>");
        let msg = dispatch(&page, &call(ToolName::Click, "#pricing", None));

        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert!(msg.is_observation());
        assert_eq!(msg.content, "[HTML]:\n<h1>Pricing</h1>");
        assert_eq!(*page.actions.lock().unwrap(), ["click #pricing", "settle"]);
    }

    #[test]
    fn type_and_select_pass_value_through() {
        let page = StaticPage::new(vec!["#q", "#plan"], "<form></form>");
        dispatch(&page, &call(ToolName::Type, "#q", Some("enterprise")));
        dispatch(&page, &call(ToolName::Select, "#plan", Some("yearly")));
        assert_eq!(
            *page.actions.lock().unwrap(),
            ["type #q enterprise", "settle", "select #plan yearly", "settle"]
        );
    }

    #[test]
    fn missing_selector_becomes_error_message() {
        let page = StaticPage::new(vec!["#pricing"], "<p>home</p>");
        let msg = dispatch(&page, &call(ToolName::Click, "#missing", None));

        assert!(msg.content.starts_with("Error:"));
        assert!(msg.content.contains("#missing"));
        assert!(msg.content.ends_with("[HTML]:\n<p>home</p>"));
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert!(page.actions.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_value_is_recoverable() {
        let page = StaticPage::new(vec!["#q"], "<input id=\"q\">");
        let msg = dispatch(&page, &call(ToolName::Type, "#q", None));
        assert!(msg.content.starts_with("Error: 'type' requires a value"));
        assert!(page.actions.lock().unwrap().is_empty());
    }
}
