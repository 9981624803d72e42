use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::schema::NavigationStep;
use crate::traits::PageHandle;
use crate::util::sleep_cancellable;

/// Replay `steps` in order against a rendered page.
///
/// The cancel token is checked before every step and during settle
/// waits. A failing step aborts with [`AppError::NavigationError`] unless
/// it is marked optional.
pub async fn run_navigation<P: PageHandle>(
    page: &mut P,
    steps: &[NavigationStep],
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    for (i, step) in steps.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        let action = step.action.as_str();
        if step.action.requires_selector() && step.selector.is_none() {
            return Err(AppError::NavigationError {
                step: i,
                action: action.to_string(),
                message: "action requires a selector".into(),
            });
        }

        tracing::debug!(step = i, %action, selector = ?step.selector, "Navigation step");
        match page.perform(step).await {
            Ok(()) => {}
            Err(AppError::Cancelled) => return Err(AppError::Cancelled),
            Err(e @ AppError::RenderTimeout(_)) if !step.optional => return Err(e),
            Err(e) if step.optional => {
                tracing::warn!(step = i, %action, error = %e, "Optional navigation step failed");
                continue;
            }
            Err(e) => {
                return Err(AppError::NavigationError {
                    step: i,
                    action: action.to_string(),
                    message: e.to_string(),
                });
            }
        }
        sleep_cancellable(step.wait_after(), cancel).await?;
    }
    Ok(())
}
