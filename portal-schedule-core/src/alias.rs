use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{Alias, ClassIdentity, Error, Provider, Result, store::FeedStore};

/// 远端课程名到本地课程的解析器
///
/// 别名只追加不修改，所以命中结果可以常驻内存；未命中不缓存，
/// 以便其他进程新建的别名能被立即看到。
#[derive(Clone)]
pub struct AliasResolver {
    store: Arc<dyn FeedStore>,
    known: Arc<RwLock<HashMap<(Provider, String), String>>>,
}

impl AliasResolver {
    pub fn new(store: Arc<dyn FeedStore>) -> Self {
        Self {
            store,
            known: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 查找别名；没有别名时原样返回远端字符串
    pub async fn resolve(&self, provider: Provider, remote_class: &str) -> Result<ClassIdentity> {
        let lookup = (provider, remote_class.to_string());
        if let Some(native) = self.known.read().await.get(&lookup) {
            return Ok(ClassIdentity::Native(native.clone()));
        }

        match self.store.find_alias(provider, remote_class).await? {
            Some(alias) => {
                self.known
                    .write()
                    .await
                    .insert(lookup, alias.native_class_id.clone());
                Ok(ClassIdentity::Native(alias.native_class_id))
            }
            None => Ok(ClassIdentity::Unaliased(remote_class.to_string())),
        }
    }

    /// 新建别名，已存在时返回 `DuplicateAlias`
    pub async fn create(
        &self,
        provider: Provider,
        remote_class: &str,
        native_class_id: &str,
    ) -> Result<Uuid> {
        let remote_class = remote_class.trim();
        let native_class_id = native_class_id.trim();
        if remote_class.is_empty() || native_class_id.is_empty() {
            return Err(Error::Config(
                "Alias needs a remote class and a native class id".to_string(),
            ));
        }

        let alias = Alias {
            id: Uuid::new_v4(),
            provider,
            remote_class: remote_class.to_string(),
            native_class_id: native_class_id.to_string(),
        };

        if !self.store.insert_alias(&alias).await? {
            return Err(Error::DuplicateAlias {
                provider,
                remote: alias.remote_class,
            });
        }

        tracing::info!(
            "Created {} alias '{}' -> '{}'",
            provider,
            alias.remote_class,
            alias.native_class_id
        );
        self.known.write().await.insert(
            (provider, alias.remote_class.clone()),
            alias.native_class_id.clone(),
        );
        Ok(alias.id)
    }
}
