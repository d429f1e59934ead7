use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use thirtyfour::prelude::*;
use tracing::debug;
use url::Url;

use crate::autofill::{FieldInfo, FormDriver};
use crate::detector::parse::is_placeholder_option;
use crate::dom::{DomSource, PageSnapshot};

/// Reads a control (or radio group) the same way `MemoryForm` does.
const FIELD_JS: &str = r#"
const els = Array.from(document.querySelectorAll(arguments[0]));
if (els.length === 0) return null;
const el = els[0];
const label = (e) => ((e.labels && e.labels[0]) ? e.labels[0].innerText : (e.value || '')).trim();
const tag = el.tagName.toLowerCase();
const type = (el.getAttribute('type') || '').toLowerCase();
const enabled = !el.disabled;
if (type === 'radio') {
  const checked = els.find((e) => e.checked);
  return { kind: 'radio', value: checked ? label(checked) : '', enabled, options: els.map(label) };
}
if (type === 'checkbox') {
  return { kind: 'checkbox', value: el.checked ? 'checked' : '', enabled, options: [] };
}
if (tag === 'select') {
  const options = Array.from(el.options).map((o) => o.text.trim());
  const value = el.selectedIndex >= 0 ? options[el.selectedIndex] : '';
  return { kind: 'select', value, enabled, options };
}
const kind = tag === 'textarea' ? 'textarea' : (type === 'number' ? 'number' : 'text');
return { kind, value: el.value || '', enabled, options: [] };
"#;

/// Assign through the native setter so framework-managed inputs see the change.
const SET_VALUE_JS: &str = r#"
const el = document.querySelector(arguments[0]);
if (!el) return false;
const proto = el.tagName === 'TEXTAREA' ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype;
Object.getOwnPropertyDescriptor(proto, 'value').set.call(el, arguments[1]);
el.dispatchEvent(new Event('input', { bubbles: true }));
el.dispatchEvent(new Event('change', { bubbles: true }));
return true;
"#;

const CHOOSE_JS: &str = r#"
const els = Array.from(document.querySelectorAll(arguments[0]));
const wanted = arguments[1];
if (els.length === 0) return false;
if (els[0].tagName === 'SELECT') {
  const el = els[0];
  const option = Array.from(el.options).find((o) => o.text.trim() === wanted);
  if (!option) return false;
  el.value = option.value;
  el.dispatchEvent(new Event('input', { bubbles: true }));
  el.dispatchEvent(new Event('change', { bubbles: true }));
  return true;
}
const label = (e) => ((e.labels && e.labels[0]) ? e.labels[0].innerText : (e.value || '')).trim();
const radio = els.find((e) => label(e) === wanted);
if (!radio) return false;
radio.click();
return true;
"#;

/// A live browser tab driven over WebDriver. Serves as the page source for
/// detection and as the form driver for autofill.
pub struct BrowserSession {
    driver: WebDriver,
}

impl BrowserSession {
    pub async fn connect(webdriver_url: &str, headless: bool) -> Result<Self> {
        let mut caps = DesiredCapabilities::chrome();
        if headless {
            caps.set_headless()?;
        }
        let driver = WebDriver::new(webdriver_url, caps).await.with_context(|| {
            format!("Failed to connect to WebDriver at {}. Is chromedriver running?", webdriver_url)
        })?;
        Ok(Self { driver })
    }

    pub async fn open(&self, url: &str) -> Result<()> {
        debug!(url, "Navigating");
        self.driver
            .goto(url)
            .await
            .with_context(|| format!("Failed to navigate to {}", url))?;
        Ok(())
    }

    pub async fn quit(self) -> Result<()> {
        self.driver.quit().await.context("Failed to close browser session")?;
        Ok(())
    }

    async fn element(&self, selector: &str) -> Result<WebElement> {
        self.driver
            .find_all(By::Css(selector))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No element matches {}", selector))
    }

    async fn script(&self, js: &str, args: Vec<Value>) -> Result<Value> {
        let ret = self.driver.execute(js, args).await.context("Script execution failed")?;
        Ok(ret.json().clone())
    }

    async fn expect_true(&self, js: &str, args: Vec<Value>, what: &str) -> Result<()> {
        match self.script(js, args).await? {
            Value::Bool(true) => Ok(()),
            _ => Err(anyhow!("{}", what)),
        }
    }
}

#[async_trait(?Send)]
impl DomSource for BrowserSession {
    async fn current_url(&self) -> Result<Url> {
        let current = self.driver.current_url().await.context("Failed to read current URL")?;
        Url::parse(current.as_str()).context("Browser reported an invalid URL")
    }

    async fn snapshot(&self) -> Result<PageSnapshot> {
        let url = self.current_url().await?;
        let html = self.driver.source().await.context("Failed to read page source")?;
        Ok(PageSnapshot { url, html })
    }
}

#[async_trait(?Send)]
impl FormDriver for BrowserSession {
    async fn field(&self, selector: &str) -> Result<Option<FieldInfo>> {
        let raw = self.script(FIELD_JS, vec![json!(selector)]).await?;
        let field: Option<FieldInfo> =
            serde_json::from_value(raw).context("Unexpected field description")?;
        Ok(field.map(|mut f| {
            f.options.retain(|o| !is_placeholder_option(o));
            if is_placeholder_option(&f.value) {
                f.value.clear();
            }
            f
        }))
    }

    async fn clear(&self, selector: &str) -> Result<()> {
        self.element(selector).await?.clear().await?;
        Ok(())
    }

    async fn type_text(&self, selector: &str, chunk: &str) -> Result<()> {
        self.element(selector).await?.send_keys(chunk).await?;
        Ok(())
    }

    async fn set_value(&self, selector: &str, value: &str) -> Result<()> {
        self.expect_true(
            SET_VALUE_JS,
            vec![json!(selector), json!(value)],
            &format!("No element matches {}", selector),
        )
        .await
    }

    async fn choose_option(&self, selector: &str, option: &str) -> Result<()> {
        self.expect_true(
            CHOOSE_JS,
            vec![json!(selector), json!(option)],
            &format!("{} has no option {:?}", selector, option),
        )
        .await
    }

    async fn set_checked(&self, selector: &str, checked: bool) -> Result<()> {
        let el = self.element(selector).await?;
        if el.is_selected().await? != checked {
            el.click().await?;
        }
        Ok(())
    }

    async fn read_value(&self, selector: &str) -> Result<String> {
        self.field(selector)
            .await?
            .map(|f| f.value)
            .ok_or_else(|| anyhow!("No element matches {}", selector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Needs chromedriver listening on localhost:9515
    async fn test_snapshot_live_page() {
        let session = BrowserSession::connect("http://localhost:9515", true)
            .await
            .expect("Failed to start session");
        session.open("https://boards.greenhouse.io/").await.unwrap();
        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.url.scheme(), "https");
        assert!(!snapshot.html.is_empty());
        assert!(session.field("#definitely-not-here").await.unwrap().is_none());
        session.quit().await.unwrap();
    }
}
