//! Image recovery sweeper.
//!
//! Recipes normally get a generated hero image shortly after extraction,
//! but generation can fail or be skipped. This secondary pass finds
//! pending/approved recipes still lacking an `image_url` and re-queues
//! generation for each, bounded by a concurrency limit so a large backlog
//! doesn't stampede the image endpoint.
//!
//! Idempotent by construction: the store query only returns gaps, so a
//! second sweep with no intervening changes queues nothing.

use crate::error::ExtractionError;
use crate::store::{ExtractionStore, ImageGenerator};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{info, warn};

/// Re-queue image generation for every recipe missing imagery.
/// Returns the number queued; per-recipe failures are logged and skipped
/// (they remain gaps for the next sweep).
pub async fn recover_missing_images(
    store: &Arc<dyn ExtractionStore>,
    generator: &Arc<dyn ImageGenerator>,
    concurrency: usize,
) -> Result<usize, ExtractionError> {
    let missing = store.recipes_missing_images().await?;
    let queued = missing.len();
    if queued == 0 {
        return Ok(0);
    }
    info!(count = queued, "recovering missing recipe images");

    stream::iter(missing.into_iter().map(|recipe| {
        let store = Arc::clone(store);
        let generator = Arc::clone(generator);
        async move {
            let summary = ingredient_summary(&recipe);
            match generator.generate(&recipe.title, &summary).await {
                Ok(url) => {
                    if let Err(e) = store.set_recipe_image(recipe.id, &url).await {
                        warn!(recipe_id = recipe.id, error = %e, "could not persist generated image url");
                    }
                }
                Err(e) => {
                    warn!(recipe_id = recipe.id, error = %e, "image generation failed");
                }
            }
        }
    }))
    .buffer_unordered(concurrency.max(1))
    .collect::<Vec<()>>()
    .await;

    Ok(queued)
}

/// Short ingredient list for the generation prompt; the first few names
/// are enough to steer the image.
fn ingredient_summary(recipe: &crate::model::Recipe) -> String {
    recipe
        .ingredients
        .iter()
        .take(5)
        .map(|i| i.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Ingredient, Recipe, RecipeStatus};
    use chrono::Utc;

    #[test]
    fn summary_takes_first_five_names() {
        let recipe = Recipe {
            id: 1,
            cookbook_id: 1,
            title: "Minestrone".into(),
            ingredients: ["beans", "celery", "carrot", "onion", "tomato", "pasta"]
                .iter()
                .map(|n| Ingredient {
                    name: n.to_string(),
                    quantity: None,
                    unit: None,
                })
                .collect(),
            instructions: vec![],
            nutrition: None,
            dietary_flags: vec![],
            source_page: 12,
            image_url: None,
            status: RecipeStatus::Pending,
            created_at: Utc::now(),
        };
        let summary = ingredient_summary(&recipe);
        assert_eq!(summary, "beans, celery, carrot, onion, tomato");
    }
}
