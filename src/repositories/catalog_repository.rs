use async_trait::async_trait;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::entities::product::{Column, Entity as Product, Model as ProductModel};
use crate::errors::ServiceError;
use crate::repositories::{ProductCatalog, Repository};

use super::BaseRepository;

/// Product lookups backed by the `products` table
#[derive(Debug, Clone)]
pub struct CatalogRepository {
    base: BaseRepository,
}

impl CatalogRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }
}

#[async_trait]
impl ProductCatalog for CatalogRepository {
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<ProductModel>, ServiceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        Product::find()
            .filter(Column::Id.is_in(ids.iter().copied()))
            .all(self.base.get_db())
            .await
            .map_err(ServiceError::DatabaseError)
    }
}

impl Repository for CatalogRepository {
    fn get_db(&self) -> &DatabaseConnection {
        self.base.get_db()
    }
}
