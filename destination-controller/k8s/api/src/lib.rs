#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod duration;
pub mod labels;
pub mod policy;
pub mod profile;

pub use self::{
    labels::Labels,
    profile::{ServiceProfile, ServiceProfileSpec},
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{
            Container, ContainerPort, EndpointAddress, EndpointPort, EndpointSubset, Endpoints,
            Node, Pod, PodSpec, PodStatus, Service, ServicePort, ServiceSpec,
        },
    },
    apimachinery::{self, pkg::apis::meta::v1::Time},
};
pub use kube::{
    api::{Api, ObjectMeta, Resource, ResourceExt},
    Client, Error,
};
