//! Template invocations and links in raw wikitext. This is a brace/bracket-aware
//! splitter, not a parser: it only needs template names and their parameters.

use crate::remote::TemplateInvocation;

const TEMPLATE_NAMESPACES: &[&str] = &[
    "template",
    "modèle",
    "vorlage",
    "plantilla",
    "modello",
    "sjabloon",
    "szablon",
    "predefinição",
];

const FILE_NAMESPACES: &[&str] = &[
    "file", "image", "media", "fichier", "datei", "bild", "archivo", "imagen", "immagine",
    "plik", "bestand", "arquivo", "imagem",
];

const CATEGORY_NAMESPACES: &[&str] = &[
    "category",
    "catégorie",
    "kategorie",
    "categoría",
    "categoria",
    "kategoria",
    "categorie",
];

/// Lowercase, underscores as spaces, single spaces, no `Template:` prefix.
pub fn normalize_template_name(name: &str) -> String {
    let spaced = normalize_spaces(&name.replace('_', " ")).to_lowercase();
    match spaced.split_once(':') {
        Some((prefix, rest)) if TEMPLATE_NAMESPACES.contains(&prefix.trim()) => {
            rest.trim().to_string()
        }
        _ => spaced,
    }
}

pub fn strip_comments(content: &str) -> String {
    let mut output = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find("<!--") {
        output.push_str(&rest[..start]);
        match rest[start + 4..].find("-->") {
            Some(end) => rest = &rest[start + 4 + end + 3..],
            None => return output,
        }
    }
    output.push_str(rest);
    output
}

/// Every template invocation in document order, nested ones included.
pub fn extract_templates(content: &str) -> Vec<TemplateInvocation> {
    let content = strip_comments(content);
    let bytes = content.as_bytes();
    let mut open = Vec::new();
    let mut found = Vec::new();
    let mut cursor = 0usize;

    while cursor + 1 < bytes.len() {
        if bytes[cursor] == b'{' && bytes[cursor + 1] == b'{' {
            open.push(cursor + 2);
            cursor += 2;
            continue;
        }
        if bytes[cursor] == b'}' && bytes[cursor + 1] == b'}' {
            if let Some(start) = open.pop()
                && let Some(invocation) = parse_invocation(&content[start..cursor])
            {
                found.push((start, invocation));
            }
            cursor += 2;
            continue;
        }
        cursor += 1;
    }

    found.sort_by_key(|(start, _)| *start);
    found.into_iter().map(|(_, invocation)| invocation).collect()
}

fn parse_invocation(inner: &str) -> Option<TemplateInvocation> {
    let mut parts = split_top_level(inner).into_iter();
    let name = normalize_spaces(parts.next()?);
    if name.is_empty() || name.starts_with(['{', '#']) {
        return None;
    }
    Some(TemplateInvocation {
        name,
        params: parts.map(str::to_string).collect(),
    })
}

/// Split on `|` outside of nested `{{ }}` and `[[ ]]`.
fn split_top_level(inner: &str) -> Vec<&str> {
    let bytes = inner.as_bytes();
    let mut parts = Vec::new();
    let mut braces = 0usize;
    let mut brackets = 0usize;
    let mut start = 0usize;
    let mut cursor = 0usize;

    while cursor < bytes.len() {
        let next = bytes.get(cursor + 1).copied();
        match bytes[cursor] {
            b'{' if next == Some(b'{') => {
                braces += 1;
                cursor += 2;
                continue;
            }
            b'}' if next == Some(b'}') && braces > 0 => {
                braces -= 1;
                cursor += 2;
                continue;
            }
            b'[' if next == Some(b'[') => {
                brackets += 1;
                cursor += 2;
                continue;
            }
            b']' if next == Some(b']') && brackets > 0 => {
                brackets -= 1;
                cursor += 2;
                continue;
            }
            b'|' if braces == 0 && brackets == 0 => {
                parts.push(&inner[start..cursor]);
                start = cursor + 1;
            }
            _ => {}
        }
        cursor += 1;
    }
    parts.push(&inner[start..]);
    parts
}

/// Target of the first `[[Page|label]]` link in `value`.
pub fn link_target(value: &str) -> Option<String> {
    link_targets(value).into_iter().next()
}

/// Targets of every `[[Page|label]]` link in `value`, in order of appearance.
pub fn link_targets(value: &str) -> Vec<String> {
    let mut targets = Vec::new();
    let mut rest = value;
    while let Some(open) = rest.find("[[") {
        let inner = &rest[open + 2..];
        let Some(close) = inner.find("]]") else {
            break;
        };
        if let Some(target) = clean_link_target(&inner[..close]) {
            targets.push(target);
        }
        rest = &inner[close + 2..];
    }
    targets
}

fn clean_link_target(link: &str) -> Option<String> {
    let target = link.split('|').next().unwrap_or("");
    let target = target.trim().trim_start_matches(':');
    let target = target.split('#').next().unwrap_or(target);
    let target = normalize_spaces(&target.replace('_', " "));
    if target.is_empty() { None } else { Some(target) }
}

/// Link target when `value` holds a link, the trimmed value otherwise.
pub fn link_target_or_text(value: &str) -> String {
    link_target(value).unwrap_or_else(|| normalize_spaces(value))
}

/// Bare file name: link brackets, parameters and any file namespace prefix removed.
pub fn strip_file_prefix(value: &str) -> String {
    let target = link_target_or_text(value);
    let target = target.split('|').next().unwrap_or("").trim();
    strip_namespace(target, FILE_NAMESPACES).to_string()
}

pub fn strip_category_prefix(value: &str) -> String {
    let target = link_target_or_text(value);
    strip_namespace(&target, CATEGORY_NAMESPACES).to_string()
}

pub fn has_category_prefix(value: &str) -> bool {
    let trimmed = value.trim();
    strip_namespace(trimmed, CATEGORY_NAMESPACES).len() != trimmed.len()
}

fn strip_namespace<'a>(value: &'a str, namespaces: &[&str]) -> &'a str {
    if let Some((prefix, rest)) = value.split_once(':')
        && namespaces.contains(&prefix.trim().to_lowercase().as_str())
    {
        return rest.trim();
    }
    value
}

/// `#REDIRECT [[Target]]` (or a localized keyword) → `Target`.
pub fn redirect_target(content: &str) -> Option<String> {
    let trimmed = content.trim_start();
    if !trimmed.starts_with('#') {
        return None;
    }
    let keyword = trimmed[1..]
        .split(|ch: char| ch.is_whitespace() || ch == '[' || ch == ':')
        .next()
        .unwrap_or("")
        .to_lowercase();
    if !matches!(
        keyword.as_str(),
        "redirect"
            | "redirection"
            | "weiterleitung"
            | "redirección"
            | "rinvia"
            | "doorverwijzing"
            | "patrz"
            | "redirecionamento"
    ) {
        return None;
    }
    link_target(trimmed)
}

fn normalize_spaces(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let mut previous_was_space = false;

    for ch in value.chars() {
        if ch.is_whitespace() {
            if !previous_was_space {
                output.push(' ');
                previous_was_space = true;
            }
        } else {
            output.push(ch);
            previous_was_space = false;
        }
    }

    output.trim().to_string()
}
