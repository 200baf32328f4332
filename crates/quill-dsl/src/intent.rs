//! Intent Parser
//!
//! Rule-based translation of short editing requests into DSL changes.
//!
//! Matching runs on a lower-cased copy of the trimmed input; extracted
//! values are sliced from the original so they keep their casing. Rules are
//! independent and evaluated in a fixed order, so one request can yield
//! several changes. A request no rule understands is `Unrecognized`.

use quill_core::{Change, DslDocument};
use thiserror::Error;

/// Maximum characters in an extracted value
pub const MAX_VALUE_CHARS: usize = 40;

const TITLE_TRIGGERS: &[&str] = &["主标题", "标题", "title", "heading"];
const SUBTITLE_TRIGGERS: &[&str] = &["副标题", "subtitle", "sub-title", "tagline"];
const THEME_COLOR_TRIGGERS: &[&str] = &["主题色", "主色", "主题颜色", "theme color", "primary color"];
const BANNER_TRIGGERS: &[&str] = &["横幅", "公告栏", "banner"];
const HIDE_WORDS: &[&str] = &["隐藏", "关闭", "去掉", "hide", "remove"];
const SHOW_WORDS: &[&str] = &["显示", "打开", "展示", "show", "display"];

const CONNECTIVES: &[&str] = &[
    "改成", "改为", "换成", "变成", "设为", "设置为", "change to", "set to", "to",
];

const CLAUSE_SEPARATORS: &[char] = &['，', ',', '。', '；', ';', '！', '!', '？', '?', '\n'];
const LEADING_TRIM: &[char] = &[':', '：', '"', '\'', '“', '”', '‘', '’', '「', '」'];
const TRAILING_TRIM: &[char] = &[
    '.', '。', '!', '！', '?', '？', ',', '，', ';', '；', ':', '：', '"', '\'', '“', '”', '‘',
    '’', '「', '」',
];

/// Guidance returned for requests no rule understands
pub const GUIDANCE: &str = "Sorry, that request was not understood. Supported requests: \
change the main title (把主标题改成：欢迎 / change title to Welcome), \
change the subtitle (把副标题改为：新品上市 / set subtitle to New arrivals), \
change the theme color (把主题色改为绿色 / change theme color to blue), \
show or hide the banner (隐藏横幅 / show the banner).";

/// Intent parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntentError {
    #[error("Unrecognized request: {guidance}")]
    Unrecognized { guidance: String },
}

impl IntentError {
    fn unrecognized() -> Self {
        IntentError::Unrecognized {
            guidance: GUIDANCE.to_string(),
        }
    }
}

/// Trimmed input with a lower-cased twin and an offset map between them
#[derive(Debug)]
pub struct NormalizedInput<'a> {
    original: &'a str,
    lower: String,
    /// `(lower_byte, original_byte)` at every character boundary of `lower`
    offsets: Vec<(usize, usize)>,
}

impl<'a> NormalizedInput<'a> {
    pub fn new(text: &'a str) -> Self {
        let original = text.trim();
        let mut lower = String::with_capacity(original.len());
        let mut offsets = Vec::with_capacity(original.len());

        for (orig_idx, c) in original.char_indices() {
            for lc in c.to_lowercase() {
                offsets.push((lower.len(), orig_idx));
                lower.push(lc);
            }
        }

        Self {
            original,
            lower,
            offsets,
        }
    }

    /// Lower-cased text used for matching
    pub fn lower(&self) -> &str {
        &self.lower
    }

    pub fn original(&self) -> &str {
        self.original
    }

    pub fn contains_any(&self, needles: &[&str]) -> bool {
        needles.iter().any(|n| self.lower.contains(n))
    }

    /// Earliest occurrence of any trigger as `(start, end)` in `lower`
    fn find_trigger(&self, triggers: &[&str]) -> Option<(usize, usize)> {
        triggers
            .iter()
            .filter_map(|t| self.lower.find(t).map(|start| (start, start + t.len())))
            .min_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
    }

    /// Map a byte offset in `lower` to the matching offset in `original`
    fn to_original(&self, lower_idx: usize) -> usize {
        if lower_idx >= self.lower.len() {
            return self.original.len();
        }
        let pos = self.offsets.partition_point(|(l, _)| *l <= lower_idx);
        match pos.checked_sub(1) {
            Some(i) => self.offsets[i].1,
            None => 0,
        }
    }

    /// Value following the first connective after `from`
    pub fn extract_value(&self, from: usize) -> Option<String> {
        let rest = self.lower.get(from..)?;
        let (conn_start, conn_len) = find_connective(rest)?;
        let value_start = from + conn_start + conn_len;

        let tail = &self.lower[value_start..];
        let value_end = tail
            .find(CLAUSE_SEPARATORS)
            .map(|i| value_start + i)
            .unwrap_or(self.lower.len());

        let start = self.to_original(value_start);
        let end = self.to_original(value_end);
        let raw = self.original.get(start..end)?;

        let value = raw
            .trim_start_matches(|c: char| c.is_whitespace() || LEADING_TRIM.contains(&c))
            .trim_end_matches(|c: char| c.is_whitespace() || TRAILING_TRIM.contains(&c));

        let len = value.chars().count();
        if len == 0 || len > MAX_VALUE_CHARS {
            return None;
        }
        Some(value.to_string())
    }
}

/// Earliest connective in `text` as `(start, len)`; longest wins on ties
fn find_connective(text: &str) -> Option<(usize, usize)> {
    CONNECTIVES
        .iter()
        .filter_map(|c| find_word(text, c).map(|start| (start, c.len())))
        .min_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
}

/// Find `needle`, requiring word boundaries when it is ASCII alphabetic
fn find_word(text: &str, needle: &str) -> Option<usize> {
    if !needle.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return text.find(needle);
    }

    let is_word = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-';
    text.match_indices(needle).map(|(i, _)| i).find(|&i| {
        let before_ok = text[..i].chars().next_back().map_or(true, |c| !is_word(c));
        let after_ok = text[i + needle.len()..]
            .chars()
            .next()
            .map_or(true, |c| !is_word(c));
        before_ok && after_ok
    })
}

/// One independent parsing rule
pub trait IntentRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// The change this rule derives from the input, if any
    fn apply(&self, input: &NormalizedInput<'_>) -> Option<Change>;
}

/// `set_text` on a fixed selector
pub struct SetTextRule {
    name: &'static str,
    triggers: &'static [&'static str],
    suppressed_by: &'static [&'static str],
    selector: &'static str,
}

impl IntentRule for SetTextRule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn apply(&self, input: &NormalizedInput<'_>) -> Option<Change> {
        if input.contains_any(self.suppressed_by) {
            return None;
        }
        let (_, trigger_end) = input.find_trigger(self.triggers)?;
        let text = input.extract_value(trigger_end)?;
        Some(Change::SetText {
            selector: self.selector.to_string(),
            text,
        })
    }
}

/// Primary theme color through a closed color vocabulary
pub struct ThemeColorRule;

impl IntentRule for ThemeColorRule {
    fn name(&self) -> &'static str {
        "theme_color"
    }

    fn apply(&self, input: &NormalizedInput<'_>) -> Option<Change> {
        let (_, trigger_end) = input.find_trigger(THEME_COLOR_TRIGGERS)?;
        let value = input.extract_value(trigger_end)?;
        let color = resolve_color(&value)?;
        Some(Change::SetStyleVar {
            selector: "body".to_string(),
            var: "--color-primary".to_string(),
            value: color,
        })
    }
}

/// Banner visibility from hide or show words
pub struct BannerRule;

impl IntentRule for BannerRule {
    fn name(&self) -> &'static str {
        "banner"
    }

    fn apply(&self, input: &NormalizedInput<'_>) -> Option<Change> {
        input.find_trigger(BANNER_TRIGGERS)?;
        let hide = input.contains_any(HIDE_WORDS);
        let show = input.contains_any(SHOW_WORDS);
        let visible = match (hide, show) {
            (true, false) => false,
            (false, true) => true,
            _ => return None,
        };
        Some(Change::Toggle {
            selector: "#banner".to_string(),
            visible,
        })
    }
}

/// Map a color phrase to a CSS color; unknown colors yield `None`
pub fn resolve_color(value: &str) -> Option<String> {
    const COLORS: &[(&str, &str)] = &[
        ("红色", "red"),
        ("红", "red"),
        ("绿色", "green"),
        ("绿", "green"),
        ("蓝色", "blue"),
        ("蓝", "blue"),
        ("黄色", "yellow"),
        ("黄", "yellow"),
        ("橙色", "orange"),
        ("橘色", "orange"),
        ("紫色", "purple"),
        ("紫", "purple"),
        ("粉色", "pink"),
        ("粉红色", "pink"),
        ("黑色", "black"),
        ("黑", "black"),
        ("白色", "white"),
        ("白", "white"),
        ("灰色", "gray"),
        ("青色", "cyan"),
        ("棕色", "brown"),
        ("金色", "gold"),
        ("银色", "silver"),
        ("藏青色", "navy"),
        ("red", "red"),
        ("green", "green"),
        ("blue", "blue"),
        ("yellow", "yellow"),
        ("orange", "orange"),
        ("purple", "purple"),
        ("pink", "pink"),
        ("black", "black"),
        ("white", "white"),
        ("gray", "gray"),
        ("grey", "gray"),
        ("cyan", "cyan"),
        ("brown", "brown"),
        ("gold", "gold"),
        ("silver", "silver"),
        ("navy", "navy"),
        ("teal", "teal"),
    ];

    let key = value.trim().to_lowercase();
    if let Some((_, css)) = COLORS.iter().find(|(name, _)| *name == key) {
        return Some(css.to_string());
    }

    let hex = key.strip_prefix('#')?;
    let is_hex = hex.chars().all(|c| c.is_ascii_hexdigit());
    if is_hex && (hex.len() == 3 || hex.len() == 6) {
        Some(key)
    } else {
        None
    }
}

/// Ordered set of independent rules
pub struct IntentParser {
    rules: Vec<Box<dyn IntentRule>>,
}

impl IntentParser {
    pub fn new() -> Self {
        Self::with_rules(vec![
            Box::new(SetTextRule {
                name: "title",
                triggers: TITLE_TRIGGERS,
                suppressed_by: SUBTITLE_TRIGGERS,
                selector: "#main-title",
            }),
            Box::new(SetTextRule {
                name: "subtitle",
                triggers: SUBTITLE_TRIGGERS,
                suppressed_by: &[],
                selector: "#subtitle",
            }),
            Box::new(ThemeColorRule),
            Box::new(BannerRule),
        ])
    }

    pub fn with_rules(rules: Vec<Box<dyn IntentRule>>) -> Self {
        Self { rules }
    }

    /// Translate a request into a DSL document
    pub fn parse(&self, text: &str) -> Result<DslDocument, IntentError> {
        let input = NormalizedInput::new(text);
        if input.lower().is_empty() {
            return Err(IntentError::unrecognized());
        }

        let mut changes = Vec::new();
        for rule in &self.rules {
            if let Some(change) = rule.apply(&input) {
                tracing::debug!("Intent rule '{}' matched", rule.name());
                changes.push(change);
            }
        }

        if changes.is_empty() {
            return Err(IntentError::unrecognized());
        }
        Ok(DslDocument::new(changes))
    }
}

impl Default for IntentParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse with the built-in rules
pub fn parse(text: &str) -> Result<DslDocument, IntentError> {
    IntentParser::new().parse(text)
}
