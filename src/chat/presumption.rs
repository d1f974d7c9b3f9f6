//! 用户人设：每个 (user, role) 最多一条，保存即覆盖

use std::sync::Arc;

use crate::core::{ChatError, RoleId, UserId, UserPresumption, ValidationError};
use crate::store::{PresumptionRepository, RoleRepository};

/// (字段名, 上限)
const LIMITS: [(&str, usize); 6] = [
    ("名称", 40),
    ("职业或身份", 20),
    ("简介", 200),
    ("最喜欢的", 20),
    ("最讨厌的", 20),
    ("其他信息", 1000),
];

/// 校验人设字段长度（按字符计）
pub fn validate_presumption(p: &UserPresumption) -> Result<(), ValidationError> {
    if p.name.trim().is_empty() {
        return Err(ValidationError::MissingField { field: LIMITS[0].0 });
    }
    let values = [
        &p.name,
        &p.occupation,
        &p.description,
        &p.likes,
        &p.dislikes,
        &p.other,
    ];
    for ((field, max), value) in LIMITS.into_iter().zip(values) {
        if value.chars().count() > max {
            return Err(ValidationError::FieldTooLong { field, max });
        }
    }
    Ok(())
}

pub struct PresumptionService {
    presumptions: Arc<dyn PresumptionRepository>,
    roles: Arc<dyn RoleRepository>,
}

impl PresumptionService {
    pub fn new(
        presumptions: Arc<dyn PresumptionRepository>,
        roles: Arc<dyn RoleRepository>,
    ) -> Self {
        Self {
            presumptions,
            roles,
        }
    }

    /// 保存当前用户对某角色的人设；请求里的 user_id / role_id 以参数为准
    pub async fn save(
        &self,
        user_id: UserId,
        role_id: RoleId,
        presumption: UserPresumption,
    ) -> Result<(), ChatError> {
        let presumption = UserPresumption {
            user_id,
            role_id,
            ..presumption
        };
        validate_presumption(&presumption)?;
        if self.roles.role(role_id).await?.is_none() {
            return Err(ValidationError::RoleNotFound(role_id).into());
        }
        self.presumptions.upsert_presumption(presumption).await?;
        Ok(())
    }

    pub async fn view(
        &self,
        user_id: UserId,
        role_id: RoleId,
    ) -> Result<Option<UserPresumption>, ChatError> {
        Ok(self.presumptions.presumption(user_id, role_id).await?)
    }
}
