//! 修订分组预处理
//!
//! 相互引用 id 的修订（含传递引用）合并为同一原子组：用并查集一次遍历求依赖闭包，
//! 组内成员只随组一起执行，不会再被单独执行。

use std::collections::HashMap;

use petgraph::unionfind::UnionFind;

use crate::core::Step;

/// 可分组的修订：自身 id 与引用的其他修订 id
pub trait Linked {
    fn id(&self) -> &str;
    fn links(&self) -> &[String];
}

impl Linked for Step {
    fn id(&self) -> &str {
        &self.id
    }

    fn links(&self) -> &[String] {
        &self.links
    }
}

/// 计算原子组：返回按首个成员位置排序的组，组内下标升序；单个修订自成一组
pub fn atomic_groups<T: Linked>(items: &[T]) -> Vec<Vec<usize>> {
    let index: HashMap<&str, usize> = items
        .iter()
        .enumerate()
        .map(|(i, item)| (item.id(), i))
        .collect();

    let mut uf = UnionFind::<usize>::new(items.len());
    for (i, item) in items.iter().enumerate() {
        for link in item.links() {
            match index.get(link.as_str()) {
                Some(&j) => {
                    uf.union(i, j);
                }
                None => {
                    tracing::warn!(item = %item.id(), link = %link, "amendment references unknown id, ignored")
                }
            }
        }
    }

    let mut by_root: HashMap<usize, usize> = HashMap::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for i in 0..items.len() {
        let root = uf.find(i);
        match by_root.get(&root) {
            Some(&g) => groups[g].push(i),
            None => {
                by_root.insert(root, groups.len());
                groups.push(vec![i]);
            }
        }
    }
    groups
}

/// 只返回包含多个成员的组
pub fn linked_groups<T: Linked>(items: &[T]) -> Vec<Vec<usize>> {
    atomic_groups(items)
        .into_iter()
        .filter(|g| g.len() > 1)
        .collect()
}
