//! Scripts evaluated in the application's active view
//!
//! Every script starts with a `// tether:<kind>` header line so hosts can log
//! or special-case them. Selectors and text are embedded as JSON string
//! literals, never spliced raw. Scripts that target an element return
//! `{"missing": true}` when it does not exist.

use serde::Serialize;
use tether_protocol::types::{ElementAction, MouseButton, StorageAction};

/// JSON literal for embedding in a script
fn literal<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".into())
}

fn script(kind: &str, consts: &[(&str, String)], body: &str) -> String {
    let mut out = format!("// tether:{}\n(() => {{\n", kind);
    for (name, value) in consts {
        out.push_str(&format!("  const {} = {};\n", name, value));
    }
    out.push_str(body);
    out.push_str("})()");
    out
}

pub fn get_dom() -> String {
    script(
        "get_dom",
        &[],
        "  return document.documentElement.outerHTML;\n",
    )
}

pub fn element_exists(selector: &str) -> String {
    script(
        "element_exists",
        &[("selector", literal(selector))],
        "  return document.querySelector(selector) !== null;\n",
    )
}

pub fn text_input(selector: Option<&str>, text: &str, clear_first: bool) -> String {
    script(
        "text_input",
        &[
            ("selector", literal(&selector)),
            ("text", literal(text)),
            ("clear", literal(&clear_first)),
        ],
        r#"  const el = selector === null ? document.activeElement : document.querySelector(selector);
  if (!el) return { missing: true };
  el.focus();
  const editable = 'value' in el;
  if (clear) { if (editable) { el.value = ''; } else { el.textContent = ''; } }
  for (const ch of text) {
    el.dispatchEvent(new KeyboardEvent('keydown', { key: ch, bubbles: true }));
    if (editable) { el.value += ch; } else { el.textContent += ch; }
    el.dispatchEvent(new InputEvent('input', { data: ch, inputType: 'insertText', bubbles: true }));
    el.dispatchEvent(new KeyboardEvent('keyup', { key: ch, bubbles: true }));
  }
  el.dispatchEvent(new Event('change', { bubbles: true }));
  return { typed: Array.from(text).length };
"#,
    )
}

pub fn element_action(selector: &str, action: ElementAction, text: Option<&str>) -> String {
    script(
        "element_action",
        &[
            ("selector", literal(selector)),
            ("action", literal(action.as_str())),
            ("text", literal(&text)),
        ],
        r#"  const el = document.querySelector(selector);
  if (!el) return { missing: true };
  el.scrollIntoView({ block: 'center' });
  if (action === 'click') {
    el.click();
  } else {
    el.focus();
    if (action === 'type' && text !== null) {
      if ('value' in el) { el.value += text; } else { el.textContent += text; }
      el.dispatchEvent(new Event('input', { bubbles: true }));
      el.dispatchEvent(new Event('change', { bubbles: true }));
    }
  }
  return { action, selector };
"#,
    )
}

pub fn element_position(selector: &str) -> String {
    script(
        "element_position",
        &[("selector", literal(selector))],
        r#"  const el = document.querySelector(selector);
  if (!el) return { missing: true };
  const r = el.getBoundingClientRect();
  return { x: r.x, y: r.y, width: r.width, height: r.height };
"#,
    )
}

pub fn mouse_movement(x: f64, y: f64, click: bool, button: MouseButton) -> String {
    script(
        "mouse_movement",
        &[
            ("x", literal(&x)),
            ("y", literal(&y)),
            ("click", literal(&click)),
            ("button", literal(&button.index())),
        ],
        r#"  const target = document.elementFromPoint(x, y) || document.body;
  const init = { clientX: x, clientY: y, button, bubbles: true };
  target.dispatchEvent(new MouseEvent('mousemove', init));
  if (click) {
    target.dispatchEvent(new MouseEvent('mousedown', init));
    target.dispatchEvent(new MouseEvent('mouseup', init));
    target.dispatchEvent(new MouseEvent(button === 2 ? 'contextmenu' : 'click', init));
  }
  return { x, y, clicked: click, target: target.tagName.toLowerCase() };
"#,
    )
}

pub fn local_storage(action: StorageAction, key: Option<&str>, value: Option<&str>) -> String {
    let action = match action {
        StorageAction::Get => "get",
        StorageAction::Set => "set",
        StorageAction::Remove => "remove",
        StorageAction::Clear => "clear",
        StorageAction::Keys => "keys",
    };
    script(
        "local_storage",
        &[
            ("action", literal(action)),
            ("key", literal(&key)),
            ("value", literal(&value)),
        ],
        r#"  switch (action) {
    case 'get': return { value: localStorage.getItem(key) };
    case 'set': localStorage.setItem(key, value); return { ok: true };
    case 'remove': localStorage.removeItem(key); return { ok: true };
    case 'clear': localStorage.clear(); return { ok: true };
    default: return { keys: Object.keys(localStorage).sort() };
  }
"#,
    )
}
