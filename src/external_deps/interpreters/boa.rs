use boa_engine::{Context, JsValue, Source};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use url::Url;

use super::{InterpreterError, InterpreterResult, JavascriptInterpreter};

const LOOP_ITERATION_LIMIT: u64 = 500_000;
const RECURSION_LIMIT: usize = 256;

/// Default interpreter backed by the Boa JavaScript engine.
///
/// Every call builds a fresh [`Context`], so nothing leaks between pages.
#[derive(Debug, Default)]
pub struct BoaJavascriptInterpreter;

impl BoaJavascriptInterpreter {
    pub fn new() -> Self {
        Self
    }

    fn extract_scripts<'a>(&self, html: &'a str) -> Vec<&'a str> {
        static SCRIPT_RE: Lazy<Regex> = Lazy::new(|| {
            RegexBuilder::new(r"<script[^>]*>(?P<body>.*?)</script>")
                .dot_matches_new_line(true)
                .case_insensitive(true)
                .build()
                .unwrap()
        });

        SCRIPT_RE
            .captures_iter(html)
            .filter_map(|caps| caps.name("body").map(|m| m.as_str()))
            .collect()
    }

    fn new_context(&self, page_url: &str) -> InterpreterResult<Context> {
        let mut context = Context::default();
        context
            .runtime_limits_mut()
            .set_loop_iteration_limit(LOOP_ITERATION_LIMIT);
        context
            .runtime_limits_mut()
            .set_recursion_limit(RECURSION_LIMIT);

        let prelude = build_prelude(page_url)?;
        context
            .eval(Source::from_bytes(&prelude))
            .map_err(|err| InterpreterError::Other(err.to_string()))?;
        Ok(context)
    }

    fn read_answer(&self, context: &mut Context) -> InterpreterResult<String> {
        let answer = context
            .eval(Source::from_bytes("__state.getValue('jschl_answer');"))
            .map_err(|err| InterpreterError::Execution(err.to_string()))?;

        if answer.is_null() || answer.is_undefined() {
            return Err(InterpreterError::Execution(
                "jschl_answer not set by script".into(),
            ));
        }

        if let Ok(number) = answer.to_number(context)
            && number.is_finite()
        {
            return Ok(format!("{number:.10}"));
        }

        to_text(&answer, context)
    }

    fn read_navigation(&self, context: &mut Context) -> InterpreterResult<Option<String>> {
        let captured = context
            .eval(Source::from_bytes(
                "__navigations.length > 0 ? String(__navigations[0]) : ''",
            ))
            .map_err(|err| InterpreterError::Other(err.to_string()))?;
        let text = to_text(&captured, context)?;
        Ok((!text.trim().is_empty()).then(|| text.trim().to_string()))
    }
}

fn to_text(value: &JsValue, context: &mut Context) -> InterpreterResult<String> {
    value
        .to_string(context)
        .map_err(|err| InterpreterError::Execution(err.to_string()))?
        .to_std_string()
        .map_err(|_| InterpreterError::Other("unable to convert interpreter output".into()))
}

/// Browser surface stubbed for page scripts. Every navigation API pushes its
/// target onto `__navigations` instead of leaving the page.
fn build_prelude(page_url: &str) -> InterpreterResult<String> {
    let parsed = Url::parse(page_url)
        .map_err(|err| InterpreterError::Other(format!("invalid page url: {err}")))?;
    let host = parsed.host_str().unwrap_or_default();
    let port = parsed.port().map(|p| p.to_string()).unwrap_or_default();
    let host_with_port = if port.is_empty() {
        host.to_string()
    } else {
        format!("{host}:{port}")
    };
    let location = serde_json::json!({
        "href": parsed.as_str(),
        "protocol": format!("{}:", parsed.scheme()),
        "host": host_with_port,
        "hostname": host,
        "port": port,
        "pathname": parsed.path(),
        "search": parsed.query().map(|q| format!("?{q}")).unwrap_or_default(),
        "hash": parsed.fragment().map(|f| format!("#{f}")).unwrap_or_default(),
        "origin": parsed.origin().ascii_serialization(),
    });
    let location = serde_json::to_string(&location)
        .map_err(|err| InterpreterError::Other(err.to_string()))?;

    Ok(format!(
        r#"
var __navigations = [];
function __navigate(target) {{
    if (target !== undefined && target !== null && String(target).length > 0) {{
        __navigations.push(String(target));
    }}
}}
var __loc = {location};
var __location = {{
    protocol: __loc.protocol,
    host: __loc.host,
    hostname: __loc.hostname,
    port: __loc.port,
    pathname: __loc.pathname,
    search: __loc.search,
    hash: __loc.hash,
    origin: __loc.origin,
    assign: function(u) {{ __navigate(u); }},
    replace: function(u) {{ __navigate(u); }},
    reload: function() {{}},
    toString: function() {{ return __loc.href; }}
}};
Object.defineProperty(__location, "href", {{
    get: function() {{ return __loc.href; }},
    set: function(u) {{ __navigate(u); }}
}});
Object.defineProperty(globalThis, "location", {{
    get: function() {{ return __location; }},
    set: function(u) {{ __navigate(u); }},
    configurable: true
}});
var window = globalThis;
var self = globalThis;
var top = globalThis;
var parent = globalThis;
function open(u) {{ __navigate(u); return window; }}
function addEventListener(name, cb) {{
    if (name === "load" || name === "DOMContentLoaded") {{ try {{ cb(); }} catch (e) {{}} }}
}}
function removeEventListener() {{}}
var navigator = {{
    userAgent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64)",
    language: "en-US",
    languages: ["en-US", "en"],
    platform: "Win32",
    webdriver: false
}};
var history = {{ replaceState: function() {{}}, pushState: function() {{}} }};
var performance = {{ now: function() {{ return Date.now(); }} }};
var console = {{ log: function() {{}}, warn: function() {{}}, error: function() {{}} }};
var __state = {{
    values: {{}},
    setValue: function(id, value) {{ this.values[id] = value; }},
    getValue: function(id) {{ return this.values[id]; }}
}};
function __makeElement(id) {{
    var element = {{
        id: id,
        style: {{}},
        attributes: {{}},
        children: [],
        addEventListener: function() {{}},
        removeEventListener: function() {{}},
        appendChild: function(child) {{ this.children.push(child); return child; }},
        setAttribute: function(name, value) {{ this.attributes[name] = value; }},
        getAttribute: function(name) {{ return this.attributes[name] || ""; }},
        click: function() {{ if (this._href) {{ __navigate(this._href); }} }},
        submit: function() {{ if (this.attributes.action) {{ __navigate(this.attributes.action); }} }}
    }};
    Object.defineProperty(element, "value", {{
        get: function() {{ return __state.getValue(id); }},
        set: function(v) {{ __state.setValue(id, v); }}
    }});
    Object.defineProperty(element, "href", {{
        get: function() {{ return this._href || ""; }},
        set: function(val) {{ this._href = String(val); }}
    }});
    Object.defineProperty(element, "innerHTML", {{
        get: function() {{ return this._innerHTML || ""; }},
        set: function(val) {{ this._innerHTML = val; }}
    }});
    return element;
}}
var document = {{
    _cache: {{}},
    cookie: "",
    referrer: "",
    readyState: "complete",
    createElement: function(tag) {{ return __makeElement(tag); }},
    querySelector: function(sel) {{ return __makeElement(sel); }},
    querySelectorAll: function() {{ return []; }},
    getElementsByTagName: function() {{ return []; }},
    addEventListener: function(name, cb) {{ if (name === "DOMContentLoaded") {{ try {{ cb(); }} catch (e) {{}} }} }},
    write: function() {{}},
    getElementById: function(id) {{
        if (!this._cache[id]) {{
            this._cache[id] = __makeElement(id);
        }}
        return this._cache[id];
    }}
}};
Object.defineProperty(document, "location", {{
    get: function() {{ return location; }},
    set: function(u) {{ __navigate(u); }}
}});
document.body = __makeElement("body");
document.defaultView = window;
function setTimeout(cb, delay) {{
    if (typeof cb === "function") {{ cb(); }} else {{ (0, eval)(String(cb)); }}
    return 0;
}}
var setInterval = setTimeout;
function clearTimeout() {{}}
var clearInterval = clearTimeout;
function atob(input) {{
    var chars = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    var str = String(input).replace(/[\s=]+/g, "").replace(/-/g, "+").replace(/_/g, "/");
    var output = "";
    var buffer = 0;
    var bits = 0;
    for (var i = 0; i < str.length; i++) {{
        var idx = chars.indexOf(str.charAt(i));
        if (idx < 0) continue;
        buffer = ((buffer << 6) | idx) & 0xffffff;
        bits += 6;
        if (bits >= 8) {{
            bits -= 8;
            output += String.fromCharCode((buffer >> bits) & 0xff);
        }}
    }}
    return output;
}}
"#
    ))
}

impl JavascriptInterpreter for BoaJavascriptInterpreter {
    fn solve_challenge(&self, page_html: &str, host: &str) -> InterpreterResult<String> {
        let scripts = self.extract_scripts(page_html);
        if scripts.is_empty() {
            return Err(InterpreterError::Execution(
                "no <script> tags found in challenge page".into(),
            ));
        }

        let mut context = self.new_context(&format!("https://{host}/"))?;

        let mut executed_any = false;
        for script in scripts {
            if script.trim().is_empty() {
                continue;
            }
            executed_any = true;
            context
                .eval(Source::from_bytes(script))
                .map_err(|err| InterpreterError::Execution(err.to_string()))?;
        }

        if !executed_any {
            return Err(InterpreterError::Execution(
                "challenge page does not contain executable JavaScript".into(),
            ));
        }

        self.read_answer(&mut context)
    }

    fn capture_navigation(
        &self,
        scripts: &[String],
        page_url: &str,
    ) -> InterpreterResult<Option<String>> {
        let mut context = self.new_context(page_url)?;

        for script in scripts {
            if script.trim().is_empty() {
                continue;
            }
            if let Err(err) = context.eval(Source::from_bytes(script.as_str())) {
                log::debug!("Page script raised an error in sandbox: {err}");
            }
            if let Some(target) = self.read_navigation(&mut context)? {
                return Ok(Some(target));
            }
        }

        Ok(None)
    }

    fn evaluate(&self, expression: &str, page_url: &str) -> InterpreterResult<String> {
        let mut context = self.new_context(page_url)?;
        let result = context
            .eval(Source::from_bytes(expression))
            .map_err(|err| InterpreterError::Execution(err.to_string()))?;
        to_text(&result, &mut context)
    }
}
