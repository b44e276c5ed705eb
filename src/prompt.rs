//! Prompt and output-filename formatting for the showcase.

/// Professions rendered by the showcase, one image each.
pub const PROFESSIONS: [&str; 8] = [
    "police officer",
    "fireman",
    "astronaut",
    "doctor",
    "scientist",
    "chef",
    "sailor",
    "aviator",
];

/// Indefinite article for a noun phrase: `an` when it starts with the
/// literal character `a`, `a` otherwise. The check is case-sensitive.
pub fn indefinite_article(noun: &str) -> &'static str {
    if noun.starts_with('a') {
        "an"
    } else {
        "a"
    }
}

/// `<article> <noun>`, e.g. `an astronaut` or `a doctor`.
pub fn subject_phrase(noun: &str) -> String {
    format!("{} {}", indefinite_article(noun), noun)
}

/// The full generation prompt for a profession.
pub fn showcase_prompt(trigger: &str, profession: &str) -> String {
    format!("{trigger} as {}", subject_phrase(profession))
}

/// Output filename for a profession, saved in the working directory.
pub fn output_filename(subject: &str, profession: &str) -> String {
    format!("{subject} as {}.png", subject_phrase(profession))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn article_is_an_for_a_prefix() {
        assert_eq!(indefinite_article("astronaut"), "an");
        assert_eq!(indefinite_article("aviator"), "an");
        assert_eq!(indefinite_article("architect"), "an");
    }

    #[test]
    fn article_is_a_otherwise() {
        assert_eq!(indefinite_article("doctor"), "a");
        assert_eq!(indefinite_article("police officer"), "a");
        // The rule is a plain prefix check, not a vowel check.
        assert_eq!(indefinite_article("engineer"), "a");
        // And it is case-sensitive.
        assert_eq!(indefinite_article("Astronaut"), "a");
        assert_eq!(indefinite_article(""), "a");
    }

    #[test]
    fn subject_phrase_matches_rule() {
        for profession in PROFESSIONS {
            let phrase = subject_phrase(profession);
            if profession.starts_with('a') {
                assert_eq!(phrase, format!("an {profession}"));
            } else {
                assert_eq!(phrase, format!("a {profession}"));
            }
        }
    }

    #[test]
    fn prompt_and_filename_formats() {
        assert_eq!(
            showcase_prompt("bacana white dog", "astronaut"),
            "bacana white dog as an astronaut"
        );
        assert_eq!(
            output_filename("bacana", "astronaut"),
            "bacana as an astronaut.png"
        );
        assert_eq!(
            output_filename("bacana", "chef"),
            "bacana as a chef.png"
        );
    }
}
