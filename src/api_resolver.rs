use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::runtime::reflector::ObjectRef;
use kube::{Api, Client, Config, Resource};

#[derive(Clone)]
pub struct ApiResolver {
    pub client: Client,
}

impl ApiResolver {
    pub fn try_new(config: Config) -> kube::Result<Self> {
        let client = Client::try_from(config)?;
        Ok(Self { client })
    }

    /// Namespaced resources across every namespace.
    pub fn all<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }

    pub fn cluster<K>(&self) -> Api<K>
    where
        K: Resource<Scope = ClusterResourceScope>,
        K::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }

    pub fn api_for_ref<K>(&self, object_ref: &ObjectRef<K>) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match object_ref.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => self.all(),
        }
    }
}
