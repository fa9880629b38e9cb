use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Conflict: {entity} with id {id} already exists")]
    Conflict { entity: &'static str, id: Uuid },
}
