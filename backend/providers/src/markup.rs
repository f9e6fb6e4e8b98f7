//! Call-control XML shared by TwiML and Plivo XML. Both dialects wrap a
//! flat list of verbs in `<Response>`.

pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Render one element. `None` body gives a self-closing tag.
pub fn element(name: &str, attrs: &[(&str, &str)], body: Option<&str>) -> String {
    let mut out = format!("<{name}");
    for (key, value) in attrs {
        out.push_str(&format!(" {key}=\"{}\"", escape_xml(value)));
    }
    match body {
        Some(body) => out.push_str(&format!(">{body}</{name}>")),
        None => out.push_str("/>"),
    }
    out
}

/// Same as [`element`] with escaped text content.
pub fn text_element(name: &str, attrs: &[(&str, &str)], text: &str) -> String {
    element(name, attrs, Some(&escape_xml(text)))
}

pub fn response<I, S>(verbs: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><Response>"#);
    for verb in verbs {
        out.push_str(verb.as_ref());
    }
    out.push_str("</Response>");
    out
}

/// Append `flow` and `callId` to a webhook URL.
pub fn flow_url(base: &str, flow: &str, call_id: Option<&str>) -> String {
    match url::Url::parse(base) {
        Ok(mut url) => {
            let retained: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, _)| k != "flow" && k != "callId")
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            {
                let mut query = url.query_pairs_mut();
                query.clear();
                for (k, v) in &retained {
                    query.append_pair(k, v);
                }
                query.append_pair("flow", flow);
                if let Some(id) = call_id {
                    query.append_pair("callId", id);
                }
            }
            url.to_string()
        }
        Err(_) => {
            let sep = if base.contains('?') { '&' } else { '?' };
            match call_id {
                Some(id) => format!("{base}{sep}flow={flow}&callId={id}"),
                None => format!("{base}{sep}flow={flow}"),
            }
        }
    }
}
