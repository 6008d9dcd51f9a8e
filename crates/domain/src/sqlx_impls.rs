//! # SQLx 数据库类型转换实现
//!
//! 本模块仅在启用 `sqlx-support` feature 时编译。
//! 状态枚举以 `VARCHAR` 形式存储，取值与 `as_str()` 一致。

use std::str::FromStr;

use crate::models::{BucketStatus, ClusterMode, JobStatus, RecurringScheduleStatus, WorkerMode};
use crate::value_objects::JobPriority;

macro_rules! impl_pg_text_enum {
    ($ty:ty) => {
        impl sqlx::Type<sqlx::Postgres> for $ty {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
            }

            fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
                <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $ty {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
                <$ty>::from_str(s).map_err(|e| e.to_string().into())
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Postgres> for $ty {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
            }
        }
    };
}

impl_pg_text_enum!(JobStatus);
impl_pg_text_enum!(RecurringScheduleStatus);
impl_pg_text_enum!(BucketStatus);
impl_pg_text_enum!(JobPriority);
impl_pg_text_enum!(WorkerMode);
impl_pg_text_enum!(ClusterMode);
