mod analyze;
mod calc;
mod config;
mod generate;
mod library;
mod upload;

use crate::state::Context;

/// Stormwater document analyst
#[poise::command(
    slash_command,
    subcommands(
        "upload::upload",
        "upload::ingest",
        "analyze::analyze",
        "analyze::review",
        "analyze::recommendations",
        "generate::generate",
        "calc::calc",
        "calc::reference",
        "library::library",
        "library::delete",
        "config::handlers",
        "config::config"
    )
)]
pub async fn storm(_ctx: Context<'_>) -> Result<(), anyhow::Error> {
    Ok(())
}

/// Send a message in Discord-safe chunks (max 1990 chars).
/// Uses ctx.say() for all chunks so follow-ups go through the interaction
/// webhook, which doesn't require Send Messages channel permission.
pub(crate) async fn send_chunked(ctx: &Context<'_>, text: &str) -> Result<(), anyhow::Error> {
    for chunk in split_chunks(text, 1990) {
        ctx.say(chunk).await?;
    }
    Ok(())
}

/// Split on the last newline (or space) before `max` bytes, never inside a char.
fn split_chunks(text: &str, max: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        let mut chunk_len = remaining.len().min(max);
        while !remaining.is_char_boundary(chunk_len) {
            chunk_len -= 1;
        }
        let split_at = if chunk_len < remaining.len() {
            remaining[..chunk_len]
                .rfind('\n')
                .or_else(|| remaining[..chunk_len].rfind(' '))
                .map(|i| i + 1)
                .unwrap_or(chunk_len)
        } else {
            chunk_len
        };
        chunks.push(&remaining[..split_at]);
        remaining = &remaining[split_at..];
    }
    chunks
}

/// Autocomplete for document ids, labelled by file name.
async fn autocomplete_document(
    ctx: Context<'_>,
    partial: &str,
) -> Vec<poise::serenity_prelude::AutocompleteChoice> {
    let docs = ctx.data().store.list(200).await.unwrap_or_default();
    let partial = partial.to_lowercase();

    docs.into_iter()
        .filter(|d| d.original_name.to_lowercase().contains(&partial) || d.id.starts_with(&partial))
        .take(25)
        .map(|d| {
            poise::serenity_prelude::AutocompleteChoice::new(
                format!("{} ({})", d.original_name, d.category),
                d.id,
            )
        })
        .collect()
}

/// Autocomplete for library categories.
async fn autocomplete_category(ctx: Context<'_>, partial: &str) -> Vec<String> {
    let categories = ctx.data().store.categories().await.unwrap_or_default();

    categories
        .into_iter()
        .filter(|c| c.to_lowercase().contains(&partial.to_lowercase()))
        .take(25)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_prefers_newlines() {
        let text = format!("{}\n{}", "a".repeat(15), "b".repeat(15));
        let chunks = split_chunks(&text, 20);
        assert_eq!(chunks, vec![format!("{}\n", "a".repeat(15)).as_str(), "b".repeat(15).as_str()]);
    }

    #[test]
    fn test_split_respects_char_boundaries() {
        let text = "é".repeat(30);
        let chunks = split_chunks(&text, 7);
        assert!(chunks.iter().all(|c| c.len() <= 7));
        assert_eq!(chunks.concat(), text);
    }
}
