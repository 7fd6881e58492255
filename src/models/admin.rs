use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::db::schema::admins;

/// Actor name used in audit entries for system-initiated actions.
pub const BOOTSTRAP_ACTOR: &str = "<bootstrap>";

/// A username with blanket authority over tokens and the admin list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = admins)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Admin {
    pub username: String,
}
