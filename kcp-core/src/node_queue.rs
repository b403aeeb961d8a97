//! Arena-backed FIFO with a free list of recycled slots

/// Ordered sequence with O(1) push-back and pop-front whose nodes live in a
/// single arena. Slots freed by `pop_front` are recycled by later pushes, so
/// steady-state traffic does not allocate.
#[derive(Debug)]
pub(crate) struct NodeQueue<T> {
    nodes: Vec<Node<T>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

#[derive(Debug)]
struct Node<T> {
    value: Option<T>,
    next: Option<usize>,
}

impl<T> NodeQueue<T> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_back(&mut self, value: T) {
        let node = Node {
            value: Some(value),
            next: None,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.nodes[index] = node;
                index
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };

        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
    }

    pub fn pop_front(&mut self) -> Option<T> {
        let index = self.head?;
        let node = &mut self.nodes[index];
        let value = node.value.take();
        self.head = node.next.take();
        if self.head.is_none() {
            self.tail = None;
        }
        self.free.push(index);
        self.len -= 1;
        value
    }

    pub fn front_mut(&mut self) -> Option<&mut T> {
        let index = self.head?;
        self.nodes[index].value.as_mut()
    }

    pub fn back(&self) -> Option<&T> {
        let index = self.tail?;
        self.nodes[index].value.as_ref()
    }

    pub fn back_mut(&mut self) -> Option<&mut T> {
        let index = self.tail?;
        self.nodes[index].value.as_mut()
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            queue: self,
            cursor: self.head,
        }
    }

    /// Drop every queued value, keeping the arena for reuse.
    pub fn clear(&mut self) {
        while self.pop_front().is_some() {}
    }

    /// Drop every queued value and give the arena memory back.
    pub fn clear_and_shrink(&mut self) {
        self.clear();
        self.nodes = Vec::new();
        self.free = Vec::new();
    }

    #[cfg(test)]
    fn arena_len(&self) -> usize {
        self.nodes.len()
    }
}

impl<T> Default for NodeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct Iter<'a, T> {
    queue: &'a NodeQueue<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = &self.queue.nodes[index];
        self.cursor = node.next;
        node.value.as_ref()
    }
}
