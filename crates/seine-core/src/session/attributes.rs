use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;

/// 类型化的会话属性键。
///
/// # 设计背景（Why）
/// - 属性表是过滤器之间唯一的会话级共享存储；裸字符串键配合运行期
///   类型检查会把类型错误推迟到取值点。键在构造时就固定值类型，
///   让不匹配的写入在编译期即不可表达。
///
/// # 契约说明（What）
/// - 键的身份由 `(值类型, 名称)` 二元组构成：同名不同类型的两个键
///   互不干扰；
/// - 建议以 `const` 形式在使用方集中声明，保证整个进程内键的唯一性。
pub struct AttributeKey<T> {
    name: &'static str,
    _value: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> AttributeKey<T> {
    /// 声明一个属性键。
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _value: PhantomData,
        }
    }

    /// 键名。
    pub const fn name(&self) -> &'static str {
        self.name
    }

    fn id(&self) -> (TypeId, &'static str) {
        (TypeId::of::<T>(), self.name)
    }
}

impl<T> Clone for AttributeKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AttributeKey<T> {}

impl<T> fmt::Debug for AttributeKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AttributeKey").field(&self.name).finish()
    }
}

/// 线程安全的会话属性表。
///
/// # 逻辑解析（How）
/// - 值以 `Arc<dyn Any + Send + Sync>` 擦除存储，取值时按键的类型参数
///   下转型；键身份包含 `TypeId`，因此下转型必然成功；
/// - 读写锁允许多条过滤线程并发读取；接收回调中的写入同样被允许，
///   写锁只覆盖表结构本身。
///
/// # 契约说明（What）
/// - `set` 返回被替换的旧值（若有）；
/// - 值以 `Arc<T>` 交付，读取方与表共享所有权，适合缓存型用法。
pub struct AttributeMap {
    entries: RwLock<HashMap<(TypeId, &'static str), Arc<dyn Any + Send + Sync>>>,
}

impl AttributeMap {
    /// 创建空表。
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// 读取属性。
    pub fn get<T: Send + Sync + 'static>(&self, key: &AttributeKey<T>) -> Option<Arc<T>> {
        let entries = self.entries.read();
        entries
            .get(&key.id())
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// 写入属性，返回被替换的旧值。
    pub fn set<T: Send + Sync + 'static>(&self, key: &AttributeKey<T>, value: T) -> Option<Arc<T>> {
        let mut entries = self.entries.write();
        entries
            .insert(key.id(), Arc::new(value))
            .and_then(|previous| previous.downcast::<T>().ok())
    }

    /// 移除属性，返回被移除的值。
    pub fn remove<T: Send + Sync + 'static>(&self, key: &AttributeKey<T>) -> Option<Arc<T>> {
        let mut entries = self.entries.write();
        entries
            .remove(&key.id())
            .and_then(|previous| previous.downcast::<T>().ok())
    }

    /// 键是否存在。
    pub fn contains<T: Send + Sync + 'static>(&self, key: &AttributeKey<T>) -> bool {
        self.entries.read().contains_key(&key.id())
    }

    /// 当前属性数量。
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// 表是否为空。
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for AttributeMap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AttributeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeMap")
            .field("len", &self.len())
            .finish()
    }
}
