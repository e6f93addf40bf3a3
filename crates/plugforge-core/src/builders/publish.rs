use super::BuildConfig;
use crate::error::{ForgeError, Result};
use crate::runner::CommandSpec;
use std::path::Path;
use tracing::info;

/// Build an image from `context` and push it when publishing is on.
/// Returns the image reference.
pub(super) async fn publish_image(
    config: &BuildConfig,
    component: &str,
    context: &Path,
) -> Result<String> {
    let image = config.image(component);
    let wrap = |e: ForgeError| match e {
        ForgeError::Cancelled { .. } => e,
        other => ForgeError::Publish {
            component: component.to_string(),
            reason: other.to_string(),
        },
    };

    info!(component, image = %image, "building image");
    config
        .runner
        .run(
            &CommandSpec::new("docker")
                .args(["build", "-t", image.as_str(), "."])
                .current_dir(context),
        )
        .await
        .map_err(wrap)?;

    if config.publish {
        config
            .runner
            .run(&CommandSpec::new("docker").args(["push", image.as_str()]))
            .await
            .map_err(wrap)?;
        info!(component, image = %image, "pushed image");
    }
    Ok(image)
}
