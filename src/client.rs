use std::collections::HashMap;

use crate::error::LLMError;
use crate::provider::DynProvider;
use crate::types::CapabilityDescriptor;

/// 后端池 按注册顺序保存所有后端
#[derive(Clone, Default)]
pub struct BackendPool {
    backends: Vec<DynProvider>,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for BackendPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendPool")
            .field("backends", &self.ids())
            .finish()
    }
}

impl BackendPool {
    /// 创建 Builder 便于后续注册后端
    pub fn builder() -> BackendPoolBuilder {
        BackendPoolBuilder {
            backends: Vec::new(),
        }
    }

    /// 按标识查找后端
    pub fn get(&self, id: &str) -> Option<&DynProvider> {
        self.index.get(id).map(|&position| &self.backends[position])
    }

    /// 查找后端 不存在时返回校验错误
    pub fn require(&self, id: &str) -> Result<&DynProvider, LLMError> {
        self.get(id).ok_or_else(|| LLMError::Validation {
            message: format!("unknown backend: {id}"),
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// 注册顺序的标识列表
    pub fn ids(&self) -> Vec<&str> {
        self.backends.iter().map(|backend| backend.id()).collect()
    }

    /// 注册顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = &DynProvider> {
        self.backends.iter()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// 查询指定后端的能力描述
    pub fn capabilities(&self, id: &str) -> Result<&CapabilityDescriptor, LLMError> {
        Ok(self.require(id)?.capabilities())
    }

    /// 已启用的后端标识
    pub fn enabled_ids(&self) -> Vec<&str> {
        self.backends
            .iter()
            .filter(|backend| backend.is_enabled())
            .map(|backend| backend.id())
            .collect()
    }

    /// 支持流式输出的后端标识
    pub fn ids_supporting_stream(&self) -> Vec<&str> {
        self.backends
            .iter()
            .filter(|backend| backend.capabilities().supports_streaming)
            .map(|backend| backend.id())
            .collect()
    }
}

/// 负责注册后端的 Builder
pub struct BackendPoolBuilder {
    backends: Vec<DynProvider>,
}

impl BackendPoolBuilder {
    /// 注册一个后端
    pub fn register(mut self, backend: DynProvider) -> Self {
        self.backends.push(backend);
        self
    }

    /// 构建后端池 标识重复时报错
    pub fn build(self) -> Result<BackendPool, LLMError> {
        let mut index = HashMap::with_capacity(self.backends.len());
        for (position, backend) in self.backends.iter().enumerate() {
            if index.insert(backend.id().to_string(), position).is_some() {
                return Err(LLMError::InvalidConfig {
                    field: "backends[].id".to_string(),
                    reason: format!("duplicate backend id {}", backend.id()),
                });
            }
        }
        Ok(BackendPool {
            backends: self.backends,
            index,
        })
    }
}
