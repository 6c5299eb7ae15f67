/// Branch slugs stop growing at this length, always at a word boundary.
const BRANCH_SLUG_MAX: usize = 40;
/// Session display names are capped at this many characters.
const SESSION_NAME_MAX: usize = 50;

/// Derive a worker branch name from its task text:
/// `feature/<slugified-task>-<4-char-time-suffix>`.
pub fn branch_name_for_task(task: &str, epoch_secs: u64) -> String {
    format!("feature/{}-{}", slugify(task), base36_suffix(epoch_secs))
}

/// Human session name: the first ~50 characters of the task, trimmed back to
/// a whole word.
pub fn session_name_for_task(task: &str) -> String {
    let task = task.trim();
    if task.chars().count() <= SESSION_NAME_MAX {
        return task.to_string();
    }

    let cut: String = task.chars().take(SESSION_NAME_MAX).collect();
    match cut.rfind(char::is_whitespace) {
        Some(idx) => cut[..idx].trim_end().to_string(),
        None => cut,
    }
}

fn slugify(task: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut length = 0;

    for word in task.split_whitespace() {
        let clean: String = word
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .flat_map(char::to_lowercase)
            .collect();
        if clean.is_empty() {
            continue;
        }
        let extra = clean.len() + usize::from(!words.is_empty());
        if length + extra > BRANCH_SLUG_MAX {
            break;
        }
        length += extra;
        words.push(clean);
    }

    if words.is_empty() {
        "task".to_string()
    } else {
        words.join("-")
    }
}

/// Last four base36 digits of a timestamp, zero-padded.
fn base36_suffix(mut n: u64) -> String {
    const DIGITS: [char; 36] = [
        '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h',
        'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
    ];

    let mut out = String::new();
    while n > 0 {
        out.insert(0, DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    while out.len() < 4 {
        out.insert(0, '0');
    }
    out[out.len() - 4..].to_string()
}
