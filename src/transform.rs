//! Text transforms applied by the build pipeline.
//!
//! Styles are compiled from SCSS and given vendor prefixes. Production output
//! has comments and whitespace stripped, leaving quoted strings and raw-text
//! elements as written. Markup gets its asset tags injected here too.

use crate::error::{MapError, MapResult};
use regex::{Captures, Regex};
use std::path::Path;
use std::sync::LazyLock;

static PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|[{;\s])(transform|transition|user-select|appearance|backface-visibility)\s*:\s*([^;{}]+)")
        .unwrap()
});

static HTML_COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static RAW_TEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<(script|style|pre|textarea)\b[^>]*>").unwrap());
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static LINE_BREAK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]*\n\s*").unwrap());
static CSS_PUNCT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*([{};,])\s*").unwrap());
static CSS_COLON_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r":\s+").unwrap());
static TAG_GAP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r">\s+<").unwrap());

/// Compile one SCSS (or plain CSS) file. Imports resolve next to the file
/// first, then under `load_path`.
pub fn compile_scss(path: &Path, load_path: &Path) -> MapResult<String> {
    let options = grass::Options::default().load_path(load_path);
    grass::from_path(path, &options).map_err(|e| MapError::compile(path, e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpanKind {
    Code,
    Quoted,
    Comment,
}

#[derive(Debug, Clone, Copy)]
struct Span {
    kind: SpanKind,
    start: usize,
    end: usize,
    closed: bool,
}

/// Split source text into code, quoted literals and comments. Literals keep
/// their delimiters; `//` comments end before the newline.
fn scan(src: &str, quotes: &[u8], line_comments: bool) -> Vec<Span> {
    let bytes = src.as_bytes();
    let mut spans = Vec::new();
    let mut code_start = 0;
    let mut i = 0;
    while i < bytes.len() {
        let next = bytes.get(i + 1).copied();
        let (kind, end, closed) = if quotes.contains(&bytes[i]) {
            let (end, closed) = quoted_end(bytes, i);
            (SpanKind::Quoted, end, closed)
        } else if bytes[i] == b'/' && next == Some(b'*') {
            match src[i + 2..].find("*/") {
                Some(off) => (SpanKind::Comment, i + off + 4, true),
                None => (SpanKind::Comment, bytes.len(), false),
            }
        } else if line_comments && bytes[i] == b'/' && next == Some(b'/') {
            let end = src[i..].find('\n').map_or(bytes.len(), |off| i + off);
            (SpanKind::Comment, end, true)
        } else {
            i += 1;
            continue;
        };

        if code_start < i {
            spans.push(Span {
                kind: SpanKind::Code,
                start: code_start,
                end: i,
                closed: true,
            });
        }
        spans.push(Span {
            kind,
            start: i,
            end,
            closed,
        });
        i = end;
        code_start = end;
    }
    if code_start < bytes.len() {
        spans.push(Span {
            kind: SpanKind::Code,
            start: code_start,
            end: bytes.len(),
            closed: true,
        });
    }
    spans
}

/// End of the literal opened at `start`. Only backtick literals may span lines.
fn quoted_end(bytes: &[u8], start: usize) -> (usize, bool) {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' if quote != b'`' => return (i, false),
            b if b == quote => return (i + 1, true),
            _ => i += 1,
        }
    }
    (bytes.len(), false)
}

fn vendor_prefixes(property: &str) -> &'static [&'static str] {
    match property {
        "user-select" => &["-webkit-", "-moz-", "-ms-"],
        "appearance" => &["-webkit-", "-moz-"],
        _ => &["-webkit-"],
    }
}

/// Add vendor-prefixed copies ahead of declarations that still need them.
pub fn autoprefix(css: &str) -> String {
    PREFIX_RE
        .replace_all(css, |caps: &Captures| {
            let lead = &caps[1];
            let property = &caps[2];
            let value = caps[3].trim_end();
            let mut out = String::from(lead);
            for prefix in vendor_prefixes(property) {
                out.push_str(&format!("{prefix}{property}: {value}; "));
            }
            out.push_str(&format!("{property}: {value}"));
            out
        })
        .into_owned()
}

pub fn minify_css(css: &str) -> String {
    fn squeeze(code: &str) -> String {
        let s = WHITESPACE_RE.replace_all(code, " ");
        let s = CSS_PUNCT_RE.replace_all(&s, "$1");
        let s = CSS_COLON_RE.replace_all(&s, ":");
        s.replace(";}", "}")
    }

    let mut out = String::with_capacity(css.len());
    let mut code = String::new();
    for span in scan(css, b"\"'", false) {
        let text = &css[span.start..span.end];
        match span.kind {
            SpanKind::Code => code.push_str(text),
            SpanKind::Comment => {}
            SpanKind::Quoted => {
                out.push_str(&squeeze(&code));
                code.clear();
                out.push_str(text);
            }
        }
    }
    out.push_str(&squeeze(&code));
    out.trim().to_string()
}

/// Strip comments, indentation and blank lines. String and template literals
/// are copied as written. Regular expression literals are not recognized, so
/// a `//` or `/*` inside one reads as a comment; `lint` flags what that breaks.
pub fn minify_js(js: &str) -> String {
    let mut out = String::with_capacity(js.len());
    let mut code = String::new();
    for span in scan(js, b"\"'`", true) {
        let text = &js[span.start..span.end];
        match span.kind {
            SpanKind::Code => code.push_str(text),
            // Keeps `a/* */b` two tokens.
            SpanKind::Comment if text.starts_with("/*") => code.push(' '),
            SpanKind::Comment => {}
            SpanKind::Quoted => {
                out.push_str(&LINE_BREAK_RE.replace_all(&code, "\n"));
                code.clear();
                out.push_str(text);
            }
        }
    }
    out.push_str(&LINE_BREAK_RE.replace_all(&code, "\n"));
    out.trim().to_string()
}

/// Something in a script that will not parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptIssue {
    pub line: usize,
    pub message: String,
}

/// Unterminated literals and comments, and the first bracket mismatch.
pub fn check_script(js: &str) -> Vec<ScriptIssue> {
    let line_of = |offset: usize| js[..offset].matches('\n').count() + 1;
    let mut issues = Vec::new();
    let mut open: Vec<(u8, usize)> = Vec::new();
    let mut mismatched = false;

    for span in scan(js, b"\"'`", true) {
        match span.kind {
            SpanKind::Quoted if !span.closed => issues.push(ScriptIssue {
                line: line_of(span.start),
                message: "unterminated string literal".to_string(),
            }),
            SpanKind::Comment if !span.closed => issues.push(ScriptIssue {
                line: line_of(span.start),
                message: "unterminated block comment".to_string(),
            }),
            SpanKind::Code if !mismatched => {
                for (idx, &b) in js.as_bytes()[span.start..span.end].iter().enumerate() {
                    let offset = span.start + idx;
                    match b {
                        b'(' | b'[' | b'{' => open.push((b, offset)),
                        b')' | b']' | b'}' => {
                            let expected = match b {
                                b')' => b'(',
                                b']' => b'[',
                                _ => b'{',
                            };
                            if open.pop().map(|(o, _)| o) != Some(expected) {
                                issues.push(ScriptIssue {
                                    line: line_of(offset),
                                    message: format!("unexpected '{}'", b as char),
                                });
                                mismatched = true;
                                break;
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    if !mismatched {
        if let Some(&(b, offset)) = open.last() {
            issues.push(ScriptIssue {
                line: line_of(offset),
                message: format!("unclosed '{}'", b as char),
            });
        }
    }
    issues.sort_by_key(|issue| issue.line);
    issues
}

/// Collapse whitespace and drop comments. The bodies of `script`, `style`,
/// `pre` and `textarea` elements are copied untouched.
pub fn minify_html(html: &str) -> String {
    fn collapse(markup: &str) -> String {
        let s = HTML_COMMENT_RE.replace_all(markup, "");
        let s = TAG_GAP_RE.replace_all(&s, "> <");
        WHITESPACE_RE.replace_all(&s, " ").into_owned()
    }

    let lower = html.to_ascii_lowercase();
    let mut out = String::with_capacity(html.len());
    let mut pos = 0;
    while let Some(caps) = RAW_TEXT_RE.captures_at(html, pos) {
        let Some(opening) = caps.get(0) else { break };
        let closing = format!("</{}", caps[1].to_ascii_lowercase());
        let end = lower[opening.end()..]
            .find(&closing)
            .map(|off| opening.end() + off)
            .and_then(|at| lower[at..].find('>').map(|gt| at + gt + 1))
            .unwrap_or(html.len());
        out.push_str(&collapse(&html[pos..opening.start()]));
        out.push_str(&html[opening.start()..end]);
        pos = end;
    }
    out.push_str(&collapse(&html[pos..]));
    out.trim().to_string()
}

/// Insert stylesheet links before `</head>` and scripts before `</body>`.
pub fn inject_tags(path: &Path, html: &str, styles: &[String], scripts: &[String]) -> MapResult<String> {
    let mut out = html.to_string();
    if !styles.is_empty() {
        let links: String = styles
            .iter()
            .map(|href| format!("<link rel=\"stylesheet\" href=\"{href}\">\n"))
            .collect();
        out = insert_before(path, &out, "</head>", &links)?;
    }
    if !scripts.is_empty() {
        let tags: String = scripts
            .iter()
            .map(|src| format!("<script src=\"{src}\"></script>\n"))
            .collect();
        out = insert_before(path, &out, "</body>", &tags)?;
    }
    Ok(out)
}

fn insert_before(path: &Path, html: &str, anchor: &str, content: &str) -> MapResult<String> {
    let lower = html.to_ascii_lowercase();
    let idx = lower
        .rfind(anchor)
        .ok_or_else(|| MapError::compile(path, format!("missing {anchor} to inject assets")))?;
    let mut out = String::with_capacity(html.len() + content.len());
    out.push_str(&html[..idx]);
    out.push_str(content);
    out.push_str(&html[idx..]);
    Ok(out)
}

/// Markup lacking an injection anchor.
pub fn missing_anchors(html: &str) -> Vec<&'static str> {
    let lower = html.to_ascii_lowercase();
    ["</head>", "</body>"]
        .into_iter()
        .filter(|anchor| !lower.contains(anchor))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn compiles_scss_with_partials_and_nesting() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("partials")).unwrap();
        fs::write(dir.path().join("partials/_base.scss"), "$gap: 4px;\nbody { margin: 0; }\n").unwrap();
        fs::write(
            dir.path().join("main.scss"),
            "@import 'partials/base';\n.map { padding: $gap * 2; .country { fill: none; } }\n",
        )
        .unwrap();

        let css = compile_scss(&dir.path().join("main.scss"), dir.path()).unwrap();
        assert!(css.contains("margin: 0"));
        assert!(css.contains("padding: 8px"));
        assert!(css.contains(".map .country"));
        assert!(!css.contains("$gap"));
    }

    #[test]
    fn scss_errors_are_compile_errors() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.scss"), "@import 'nope';").unwrap();
        let err = compile_scss(&dir.path().join("a.scss"), dir.path()).unwrap_err();
        assert!(matches!(err, MapError::Compile { ref path, .. } if path.ends_with("a.scss")));

        fs::write(dir.path().join("b.scss"), ".x { color: $undefined; }").unwrap();
        assert!(compile_scss(&dir.path().join("b.scss"), dir.path()).is_err());

        fs::write(dir.path().join("c.scss"), ".x { color: red;\n").unwrap();
        assert!(compile_scss(&dir.path().join("c.scss"), dir.path()).is_err());
    }

    #[test]
    fn prefixes_listed_properties_once() {
        let css = ".a { transform: scale(2); color: red; }\n.b{user-select:none}";
        let out = autoprefix(css);
        assert!(out.contains("-webkit-transform: scale(2); transform: scale(2);"));
        assert!(out.contains("-moz-user-select: none"));
        assert!(out.contains("-ms-user-select: none"));
        assert!(!out.contains("-webkit-color"));
        assert_eq!(out.matches("-webkit-transform").count(), 1);
    }

    #[test]
    fn does_not_prefix_values_or_prefixed_properties() {
        let css = ".a { transition: transform 1s; -webkit-transform: none; }";
        let out = autoprefix(css);
        assert!(out.contains("-webkit-transition: transform 1s;"));
        assert!(!out.contains("-webkit--webkit-transform"));
    }

    #[test]
    fn minifies_css() {
        let css = "/* map */\n.country {\n  fill: #ddd;\n  stroke: black;\n}\n\n.a, .b { color : red ; }\n";
        assert_eq!(minify_css(css), ".country{fill:#ddd;stroke:black}.a,.b{color :red}");
    }

    #[test]
    fn css_minifier_leaves_strings_alone() {
        let css = ".q::before { content: \"a: b ; c\"; }\n/* it's */ .r { font-family: 'Open Sans', serif; }\n";
        assert_eq!(
            minify_css(css),
            ".q::before{content:\"a: b ; c\"}.r{font-family:'Open Sans',serif}"
        );
    }

    #[test]
    fn minifies_js() {
        let js = "\"use strict\";\n\n// comment\nvar a = 1; /* inline */\n  function f() {\n    return a;\n  }\n";
        assert_eq!(minify_js(js), "\"use strict\";\nvar a = 1;\nfunction f() {\nreturn a;\n}");
    }

    #[test]
    fn js_minifier_keeps_comment_markers_inside_strings() {
        let js = "var url = \"http://example.com/*\";\nvar tpl = `a\n  b // c`;\n// gone\nreturn/* x */url;\n";
        assert_eq!(
            minify_js(js),
            "var url = \"http://example.com/*\";\nvar tpl = `a\n  b // c`;\nreturn url;"
        );
    }

    #[test]
    fn script_check_reports_unparseable_code() {
        assert!(check_script("function f() {\n  return [1, (2)];\n}\nvar s = '}';\n").is_empty());

        let issues = check_script("var a = 'open;\nvar b = 1;\n");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].line, 1);
        assert!(issues[0].message.contains("string"));

        let issues = check_script("if (x) {\n  y();\n");
        assert_eq!(issues, vec![ScriptIssue { line: 1, message: "unclosed '{'".to_string() }]);

        let issues = check_script("f(a]);\n/* never closed");
        let lines: Vec<usize> = issues.iter().map(|i| i.line).collect();
        assert_eq!(lines, vec![1, 2]);
        assert_eq!(issues[0].message, "unexpected ']'");
    }

    #[test]
    fn minifies_html_conservatively() {
        let html = "<html>\n  <!-- note -->\n  <body>\n    <h2>World   Cup</h2>\n  </body>\n</html>\n";
        assert_eq!(minify_html(html), "<html> <body> <h2>World Cup</h2> </body> </html>");
    }

    #[test]
    fn raw_text_elements_survive_html_minification() {
        let html = "<body>\n<script>\n// init\nvar ready = true;\n</script>\n<PRE>  a\n   b</PRE>\n</body>";
        assert_eq!(
            minify_html(html),
            "<body> <script>\n// init\nvar ready = true;\n</script> <PRE>  a\n   b</PRE> </body>"
        );
        assert_eq!(minify_html("<style>\n a { }"), "<style>\n a { }");
    }

    #[test]
    fn injects_links_and_scripts() {
        let html = "<html><head><title>x</title></head><body><div></div></body></html>";
        let out = inject_tags(
            Path::new("index.html"),
            html,
            &["/index.css".to_string()],
            &["/index.js".to_string()],
        )
        .unwrap();
        let link = out.find("<link rel=\"stylesheet\" href=\"/index.css\">").unwrap();
        assert!(link < out.find("</head>").unwrap());
        let script = out.find("<script src=\"/index.js\"></script>").unwrap();
        assert!(script > out.find("<div>").unwrap());
        assert!(script < out.find("</body>").unwrap());
    }

    #[test]
    fn injection_needs_anchor() {
        let err = inject_tags(Path::new("x.html"), "<body></body>", &["/x.css".to_string()], &[]).unwrap_err();
        assert!(err.to_string().contains("</head>"));
        assert_eq!(inject_tags(Path::new("x.html"), "<p>", &[], &[]).unwrap(), "<p>");
    }

    #[test]
    fn reports_missing_anchors() {
        assert_eq!(missing_anchors("<HEAD></HEAD><body></body>"), Vec::<&str>::new());
        assert_eq!(missing_anchors("<p>hi</p>"), vec!["</head>", "</body>"]);
    }
}
