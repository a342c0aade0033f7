//! SeaORM entities for follow-ups and their sequence rules

pub mod follow_ups {
    use sea_orm::entity::prelude::*;
    use serde::Serialize;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize)]
    #[sea_orm(table_name = "follow_ups")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub client_id: i64,
        pub workspace_id: i64,
        pub status: String,
        pub current_step_order: i32,
        pub next_step_at: Option<chrono::NaiveDateTime>,
        /// Rule of the most recently scheduled step
        pub last_rule_id: Option<i64>,
        /// Queue job standing for this follow-up, if any
        pub active_job_id: Option<String>,
        /// `{client_id}:{workspace_id}` while ACTIVE; unique
        #[serde(skip)]
        pub active_key: Option<String>,
        pub created_at: chrono::NaiveDateTime,
        pub updated_at: chrono::NaiveDateTime,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod sequence_rules {
    use sea_orm::entity::prelude::*;
    use serde::Serialize;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize)]
    #[sea_orm(table_name = "sequence_rules")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub workspace_id: i64,
        pub delay_ms: i64,
        #[sea_orm(column_type = "Text")]
        pub message_content: String,
        pub created_at: chrono::NaiveDateTime,
        pub updated_at: chrono::NaiveDateTime,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}
