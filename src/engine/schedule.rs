use std::time::Instant;

use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::{Engine, EngineError};

impl Engine {
    /// Publish a batch of slots. Providers publish for themselves; admins name
    /// the provider with `target_provider`.
    pub async fn publish_availability(
        &self,
        actor: &Identity,
        candidates: Vec<SlotCandidate>,
        target_provider: Option<Ulid>,
    ) -> Result<PublishOutcome, EngineError> {
        let started = Instant::now();
        let result = match self.publish_target(actor, target_provider) {
            Ok(provider_id) => self.publish(provider_id, candidates).await,
            Err(e) => Err(e),
        };
        observability::record("publish_availability", started, &result);
        result
    }

    fn publish_target(
        &self,
        actor: &Identity,
        target_provider: Option<Ulid>,
    ) -> Result<Ulid, EngineError> {
        match actor.role {
            Role::Provider => match target_provider {
                Some(target) if target != actor.id => Err(EngineError::Forbidden(
                    "providers can only publish their own availability".into(),
                )),
                _ => Ok(actor.id),
            },
            Role::Admin => {
                let target = target_provider.ok_or_else(|| {
                    EngineError::Validation("admins must name the provider to publish for".into())
                })?;
                if !self.directory.is_provider(&target) {
                    return Err(EngineError::NotFound("provider", target));
                }
                Ok(target)
            }
            Role::Consumer => Err(EngineError::Forbidden(
                "consumers cannot publish availability".into(),
            )),
        }
    }

    /// Delete one of the calling provider's unbooked slots.
    pub async fn delete_slot(&self, actor: &Identity, slot_id: Ulid) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = if actor.role != Role::Provider {
            Err(EngineError::Forbidden("only providers can delete slots".into()))
        } else {
            self.remove_slot(slot_id, actor.id).await
        };
        observability::record("delete_slot", started, &result);
        result
    }
}
