/// Case-insensitive subsequence score of `query` against `candidate`.
///
/// Returns `None` when the query characters do not all appear in order.
/// Consecutive matches, word starts and exact or substring hits score higher;
/// long candidates are penalized slightly.
pub fn fuzzy_score(query: &str, candidate: &str) -> Option<i64> {
    let query: Vec<char> = query
        .to_lowercase()
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect();
    if query.is_empty() {
        return Some(0);
    }
    let lowered = candidate.to_lowercase();
    let chars: Vec<char> = lowered.chars().collect();

    let mut score = 0i64;
    let mut next = 0usize;
    let mut previous: Option<usize> = None;
    for (index, ch) in chars.iter().enumerate() {
        if next == query.len() {
            break;
        }
        if *ch != query[next] {
            continue;
        }
        score += 1;
        if previous.is_some_and(|prev| prev + 1 == index) {
            score += 5;
        }
        if index == 0 || !chars[index - 1].is_alphanumeric() {
            score += 3;
        }
        previous = Some(index);
        next += 1;
    }
    if next < query.len() {
        return None;
    }

    let needle: String = query.iter().collect();
    let compact: String = chars.iter().filter(|ch| !ch.is_whitespace()).collect();
    if compact == needle {
        score += 100;
    } else if compact.contains(&needle) {
        score += 20;
    }
    let extra = chars.len().saturating_sub(query.len()) as i64;
    Some(score - extra / 4)
}
