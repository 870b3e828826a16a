//! Catalog listing: status filter, name regex, sorting, cursor pagination.

use regex::Regex;
use tracing::info;

use capstan_core::{Release, Status};

use crate::error::ServiceError;
use crate::requests::{ListRequest, ListResponse, ListSortBy, ListSortOrder, RequestContext};
use crate::ReleaseService;

const DEFAULT_LIST_LIMIT: u64 = 512;

impl ReleaseService {
    pub async fn list_releases(
        &self,
        ctx: &RequestContext,
        req: ListRequest,
    ) -> Result<ListResponse, ServiceError> {
        self.check_client(ctx)?;

        let codes = if req.status_codes.is_empty() {
            vec![Status::Deployed]
        } else {
            req.status_codes.clone()
        };
        let mut rels = self
            .store
            .list(&|r: &Release| codes.contains(&r.info.status))
            .await?;

        if !req.filter.is_empty() {
            let re = Regex::new(&req.filter)
                .map_err(|e| ServiceError::InvalidArgument(format!("bad filter: {}", e)))?;
            rels.retain(|r| re.is_match(&r.name));
        }

        let total = rels.len() as u64;

        match req.sort_by {
            ListSortBy::Name => rels.sort_by(|a, b| a.name.cmp(&b.name)),
            ListSortBy::LastReleased => rels.sort_by_key(|r| r.info.last_deployed),
        }
        if req.sort_order == ListSortOrder::Desc {
            rels.reverse();
        }

        if !req.offset.is_empty() {
            let idx = rels
                .iter()
                .position(|r| r.name == req.offset)
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("offset {:?} not found", req.offset))
                })?;
            rels = rels.split_off(idx);
        }

        let limit = if req.limit == 0 {
            DEFAULT_LIST_LIMIT
        } else {
            req.limit
        };
        let mut next = String::new();
        if rels.len() as u64 > limit {
            next = rels[limit as usize].name.clone();
            rels.truncate(limit as usize);
        }

        info!(count = rels.len(), total, "list: page assembled");
        Ok(ListResponse {
            count: rels.len() as u64,
            next,
            total,
            releases: rels,
        })
    }
}
