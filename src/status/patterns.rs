use once_cell::sync::Lazy;
use regex::Regex;

/// Spinner glyphs agent CLIs render while working.
const SPINNER_GLYPHS: &[char] = &[
    '⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏', '⠂', '⠐', '✢', '✳', '✶', '✻', '✽', '·',
];

/// Whimsical present-participle verbs Claude Code shows next to its token
/// counter while a turn is in flight.
const SPINNER_VERBS: &[&str] = &[
    "Accomplishing",
    "Actioning",
    "Actualizing",
    "Baking",
    "Brewing",
    "Calculating",
    "Cerebrating",
    "Churning",
    "Clauding",
    "Coalescing",
    "Cogitating",
    "Computing",
    "Combobulating",
    "Concocting",
    "Conjuring",
    "Considering",
    "Cooking",
    "Crafting",
    "Creating",
    "Crunching",
    "Deciphering",
    "Deliberating",
    "Determining",
    "Digesting",
    "Doing",
    "Effecting",
    "Elucidating",
    "Envisioning",
    "Finagling",
    "Flibbertigibbeting",
    "Forging",
    "Forming",
    "Frolicking",
    "Generating",
    "Germinating",
    "Hatching",
    "Herding",
    "Honking",
    "Hustling",
    "Ideating",
    "Incubating",
    "Inferring",
    "Jiving",
    "Manifesting",
    "Marinating",
    "Meandering",
    "Moseying",
    "Mulling",
    "Mustering",
    "Musing",
    "Noodling",
    "Percolating",
    "Perusing",
    "Philosophising",
    "Pondering",
    "Processing",
    "Puttering",
    "Puzzling",
    "Reticulating",
    "Ruminating",
    "Scheming",
    "Schlepping",
    "Shimmying",
    "Shucking",
    "Simmering",
    "Smooshing",
    "Spelunking",
    "Spinning",
    "Stewing",
    "Sussing",
    "Synthesizing",
    "Thinking",
    "Tinkering",
    "Transmuting",
    "Unfurling",
    "Unravelling",
    "Vibing",
    "Whirring",
    "Wibbling",
    "Wizarding",
    "Working",
    "Wrangling",
];

/// Closed set of yes/no and permission prompt shapes.
static WAITING_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\[Y/n\]",
        r"\[y/N\]",
        r"\(y/n\)",
        r"(?i)do you want to",
        r"(?i)would you like to",
        r"(?i)\ballow\b.*\?",
        r"(?i)proceed\?",
        r"(?i)needs your permission",
        r"(?i)waiting for (your )?input",
        r"❯\s*1\.",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("Invalid waiting pattern regex"))
    .collect()
});

fn last_lines(text: &str, count: usize) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].to_vec()
}

/// Busy-indicator scan over the tail of pane text.
///
/// Only the last ~10 lines are inspected so old scrollback cannot produce
/// false positives.
pub fn is_busy(pane: &str) -> bool {
    let tail = last_lines(pane, 10);

    if tail
        .iter()
        .any(|line| line.to_lowercase().contains("esc to interrupt"))
    {
        return true;
    }

    let spinner_tail = last_lines(pane, 5);
    if spinner_tail
        .iter()
        .any(|line| line.chars().any(|c| SPINNER_GLYPHS.contains(&c)))
    {
        return true;
    }

    // Token counter plus a spinner verb on the same tail means a turn is
    // actively streaming
    let has_tokens = tail.iter().any(|line| line.to_lowercase().contains("tokens"));
    has_tokens
        && tail
            .iter()
            .any(|line| SPINNER_VERBS.iter().any(|verb| line.contains(verb)))
}

/// Waiting-prompt scan over the last 5 pane lines.
pub fn is_waiting_prompt(pane: &str) -> bool {
    let tail = last_lines(pane, 5);
    tail.iter()
        .any(|line| WAITING_PATTERNS.iter().any(|re| re.is_match(line)))
}

/// True when any of the provider's configured patterns appears in the last
/// `lines` lines of pane text.
pub fn matches_any(pane: &str, patterns: &[String], lines: usize) -> bool {
    if patterns.is_empty() {
        return false;
    }
    let tail = last_lines(pane, lines);
    tail.iter()
        .any(|line| patterns.iter().any(|p| line.contains(p.as_str())))
}
