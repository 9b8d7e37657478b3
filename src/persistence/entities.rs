use sea_orm::entity::prelude::*;

pub mod entity_request_limit {
    use super::*;
    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "api_model_daily_usage")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub api_key: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub model: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub day: String,
        #[sea_orm(column_type = "BigInteger")]
        pub count: i64,
        #[sea_orm(column_type = "BigInteger")]
        pub updated_at: i64,
    }
    #[derive(Copy, Clone, Debug, EnumIter)]
    pub enum Relation {}
    impl RelationTrait for Relation {
        fn def(&self) -> RelationDef {
            panic!()
        }
    }
    impl ActiveModelBehavior for ActiveModel {}
}

pub mod entity_daily_usage {
    use super::*;
    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "api_key_model_daily_usage")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub api_key: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub model: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub day: String,
        #[sea_orm(column_type = "BigInteger")]
        pub requests: i64,
        #[sea_orm(column_type = "BigInteger")]
        pub failed_requests: i64,
        #[sea_orm(column_type = "BigInteger")]
        pub input_tokens: i64,
        #[sea_orm(column_type = "BigInteger")]
        pub output_tokens: i64,
        #[sea_orm(column_type = "BigInteger")]
        pub reasoning_tokens: i64,
        #[sea_orm(column_type = "BigInteger")]
        pub cached_tokens: i64,
        #[sea_orm(column_type = "BigInteger")]
        pub total_tokens: i64,
        #[sea_orm(column_type = "BigInteger")]
        pub cost_micro_usd: i64,
        #[sea_orm(column_type = "BigInteger")]
        pub updated_at: i64,
    }
    #[derive(Copy, Clone, Debug, EnumIter)]
    pub enum Relation {}
    impl RelationTrait for Relation {
        fn def(&self) -> RelationDef {
            panic!()
        }
    }
    impl ActiveModelBehavior for ActiveModel {}
}

pub mod entity_model_price {
    use super::*;
    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "model_prices")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub model: String,
        #[sea_orm(column_type = "BigInteger")]
        pub prompt_micro_usd_per_1m: i64,
        #[sea_orm(column_type = "BigInteger")]
        pub completion_micro_usd_per_1m: i64,
        #[sea_orm(column_type = "BigInteger")]
        pub cached_micro_usd_per_1m: i64,
        #[sea_orm(column_type = "BigInteger")]
        pub updated_at: i64,
    }
    #[derive(Copy, Clone, Debug, EnumIter)]
    pub enum Relation {}
    impl RelationTrait for Relation {
        fn def(&self) -> RelationDef {
            panic!()
        }
    }
    impl ActiveModelBehavior for ActiveModel {}
}

// Convenient aliases to match the names used across the persistence layer
pub use entity_daily_usage::{
    ActiveModel as ActiveModelDailyUsage, Column as ColumnDailyUsage, Entity as EntityDailyUsage,
};
pub use entity_model_price::{
    ActiveModel as ActiveModelModelPrice, Column as ColumnModelPrice, Entity as EntityModelPrice,
};
pub use entity_request_limit::{
    ActiveModel as ActiveModelRequestLimit, Column as ColumnRequestLimit,
    Entity as EntityRequestLimit,
};
