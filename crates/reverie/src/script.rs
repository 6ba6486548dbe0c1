//! Generation of page-side scripts.
//!
//! Every evaluation is wrapped in a template that reports its outcome
//! through a per-instance bridge object the worker installs on the page
//! (`window['__reverie_<identifier>']`), so concurrent instances never
//! see each other's completions. The completion convention is picked by
//! the supplied function's shape:
//!
//! - declared arity exactly one greater than the argument count: a
//!   `(err, result)` callback is appended and the function decides when
//!   to finish;
//! - returns a thenable: settled when the promise settles;
//! - anything else: the return value resolves the evaluation
//!   synchronously.
//!
//! A thrown exception always rejects.

use serde_json::Value;

/// The window key under which the worker installs the completion bridge.
pub(crate) fn bridge_key(identifier: &str) -> String {
    format!("__reverie_{identifier}")
}

/// JSON is almost valid JavaScript; the two line-separator code points
/// are the exception and must be escaped before embedding.
fn embed_json(value: &Value) -> String {
    let json = value.to_string();
    json.replace('\u{2028}', "\\u2028").replace('\u{2029}', "\\u2029")
}

/// Wrap a function source and pre-serialized arguments into a script
/// that runs the function and reports through the instance bridge.
pub(crate) fn execute(identifier: &str, src: &str, args: &[Value]) -> String {
    let embedded: Vec<String> = args.iter().map(embed_json).collect();
    let args_src = embedded.join(", ");
    let bridge = bridge_key(identifier);
    format!(
        r#"(function () {{
  var bridge = window['{bridge}'];
  try {{
    var fn = ({src});
    var args = [{args_src}];
    if (fn.length === args.length + 1) {{
      args.push(function (err, result) {{
        if (err) {{ bridge.reject(err); }} else {{ bridge.resolve(result); }}
      }});
      fn.apply(null, args);
    }} else {{
      var response = fn.apply(null, args);
      if (response && typeof response.then === 'function') {{
        response.then(function (result) {{ bridge.resolve(result); }},
                      function (err) {{ bridge.reject(err); }});
      }} else {{
        bridge.resolve(response);
      }}
    }}
  }} catch (err) {{
    bridge.reject(err);
  }}
}})();"#
    )
}

/// Wrap raw statements (an injected library, say) so that completion is
/// reported once they have run.
pub(crate) fn inject(identifier: &str, src: &str) -> String {
    let bridge = bridge_key(identifier);
    format!(
        r#"(function () {{
  var bridge = window['{bridge}'];
  try {{
    {src}
    bridge.resolve(undefined);
  }} catch (err) {{
    bridge.reject(err);
  }}
}})();"#
    )
}

// Page-side sources for the built-in operations. Each is a function
// literal; `execute` supplies the arguments and the completion bridge.

pub(crate) const EXISTS_SRC: &str =
    "function (selector) { return document.querySelector(selector) !== null; }";

pub(crate) const VISIBLE_SRC: &str = "function (selector) {
  var el = document.querySelector(selector);
  return !!el && el.offsetWidth > 0 && el.offsetHeight > 0;
}";

pub(crate) const TITLE_SRC: &str = "function () { return document.title; }";

pub(crate) const URL_SRC: &str = "function () { return document.location.href; }";

pub(crate) const PATH_SRC: &str = "function () { return document.location.pathname; }";

pub(crate) const CLICK_SRC: &str = "function (selector) {
  if (document.activeElement) { document.activeElement.blur(); }
  var el = document.querySelector(selector);
  if (!el) { throw new Error('cannot find element ' + selector); }
  var event = document.createEvent('MouseEvent');
  event.initEvent('click', true, true);
  el.dispatchEvent(event);
}";

pub(crate) const MOUSE_EVENT_SRC: &str = "function (selector, type) {
  var el = document.querySelector(selector);
  if (!el) { throw new Error('cannot find element ' + selector); }
  var event = document.createEvent('MouseEvent');
  event.initEvent(type, true, true);
  el.dispatchEvent(event);
}";

pub(crate) const SET_CHECKED_SRC: &str = "function (selector, checked) {
  var el = document.querySelector(selector);
  if (!el) { throw new Error('cannot find element ' + selector); }
  el.checked = checked;
  var event = document.createEvent('HTMLEvents');
  event.initEvent('change', true, true);
  el.dispatchEvent(event);
}";

pub(crate) const SELECT_SRC: &str = "function (selector, value) {
  var el = document.querySelector(selector);
  if (!el) { throw new Error('cannot find element ' + selector); }
  el.value = value;
  var event = document.createEvent('HTMLEvents');
  event.initEvent('change', true, true);
  el.dispatchEvent(event);
}";

pub(crate) const BACK_SRC: &str = "function () { window.history.back(); }";

pub(crate) const FORWARD_SRC: &str = "function () { window.history.forward(); }";

pub(crate) const REFRESH_SRC: &str = "function () { window.location.reload(); }";

pub(crate) const SCROLL_SRC: &str = "function (top, left) {
  window.scrollTo(left, top);
}";

pub(crate) const FOCUS_SRC: &str = "function (selector) {
  var el = document.querySelector(selector);
  if (!el) { throw new Error('cannot find element ' + selector); }
  el.focus();
}";

pub(crate) const BLUR_SRC: &str = "function (selector) {
  var el = document.querySelector(selector);
  if (el) { el.blur(); }
}";

pub(crate) const CLEAR_VALUE_SRC: &str = "function (selector) {
  var el = document.querySelector(selector);
  if (!el) { throw new Error('cannot find element ' + selector); }
  el.value = '';
}";
