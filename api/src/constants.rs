pub const GROUP: &str = "ingress.v3.haproxy.org";
pub const VERSION: &str = "v3";

pub const INGRESS_CLASS_CONTROLLER: &str = "haproxy.org/ingress-controller";
pub const GATEWAY_CLASS_CONTROLLER_NAME: &str = "haproxy.org/gateway-controller";

pub const INGRESS_CLASS_ANNOTATION: &str = "ingress.class";
pub const DEFAULT_INGRESS_CLASS_ANNOTATION: &str = "ingressclass.kubernetes.io/is-default-class";

pub const ANNOTATION_PREFIXES: [&str; 3] = [
    "haproxy.org/",
    "ingress.kubernetes.io/",
    "haproxy.com/",
];

pub const GLOBAL_CRD_KIND: &str = "Global";
pub const DEFAULTS_CRD_KIND: &str = "Defaults";
pub const BACKEND_CRD_KIND: &str = "Backend";
pub const FRONTEND_CRD_KIND: &str = "Frontend";
pub const TCP_CRD_KIND: &str = "TCP";
