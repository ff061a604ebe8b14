//! Lyrics file discovery next to the playing track.
//!
//! A pattern list is `;`-separated. In each pattern `$` stands for the track's file name
//! without extension, `*` matches any run of characters and `?` exactly one. Patterns are
//! tried in order; within a pattern the first match in name order wins.

use std::path::{Path, PathBuf};

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyRun,
    AnyOne,
}

fn tokenize(pattern: &str, stem: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for c in pattern.chars() {
        match c {
            '$' => tokens.extend(stem.chars().map(Token::Literal)),
            '*' => tokens.push(Token::AnyRun),
            '?' => tokens.push(Token::AnyOne),
            other => tokens.push(Token::Literal(other)),
        }
    }
    tokens
}

fn matches(tokens: &[Token], name: &[char]) -> bool {
    match tokens.split_first() {
        None => name.is_empty(),
        Some((Token::AnyRun, rest)) => (0..=name.len()).any(|skip| matches(rest, &name[skip..])),
        Some((Token::AnyOne, rest)) => !name.is_empty() && matches(rest, &name[1..]),
        Some((Token::Literal(c), rest)) => name.first() == Some(c) && matches(rest, &name[1..]),
    }
}

/// Whether `file_name` matches a single pattern with `$` bound to `stem`.
pub fn pattern_matches(pattern: &str, stem: &str, file_name: &str) -> bool {
    let tokens = tokenize(pattern, stem);
    let name: Vec<char> = file_name.chars().collect();
    matches(&tokens, &name)
}

/// Find the first file in the track's directory matching `pattern_list`.
///
/// Returns `None` for URLs, paths without a parent directory, unreadable directories and
/// when nothing matches. The track itself is never returned.
pub fn find_matching_file(track: &str, pattern_list: &str) -> Option<PathBuf> {
    if track.contains("://") {
        return None;
    }
    let track = Path::new(track);
    let dir = match track.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let stem = track.file_stem()?.to_string_lossy().into_owned();
    let own_name = track.file_name().map(|n| n.to_string_lossy().into_owned());

    let mut names: Vec<String> = std::fs::read_dir(&dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    for pattern in pattern_list.split(';').filter(|p| !p.is_empty()) {
        let tokens = tokenize(pattern, &stem);
        let hit = names.iter().find(|name| {
            Some(name.as_str()) != own_name.as_deref()
                && matches(&tokens, &name.chars().collect::<Vec<_>>())
        });
        if let Some(name) = hit {
            return Some(dir.join(name));
        }
    }
    None
}
